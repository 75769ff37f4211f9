use serde::{Deserialize, Serialize};
use std::fmt;

use crate::UserId;

/// 发布/订阅主题
///
/// 每个用户一个主题，主题名就是用户ID的十进制字符串。
/// 同一用户的所有设备订阅同一个主题。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn for_user(user_id: UserId) -> Self {
        Self(user_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_stringified_user_id() {
        let topic = Topic::for_user(UserId::new(1024));
        assert_eq!(topic.as_str(), "1024");
        assert_eq!(topic, Topic::for_user(UserId::new(1024)));
    }
}
