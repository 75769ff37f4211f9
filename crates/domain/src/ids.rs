//! 标识类型
//!
//! 用户、聊天和消息均使用数据库自增整数作为标识，0 表示"未设置"。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }
    };
}

numeric_id!(
    /// 用户标识
    UserId
);
numeric_id!(
    /// 聊天（私聊或群聊）标识
    ChatId
);
numeric_id!(
    /// 消息标识，持久化后由数据库分配
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id: UserId = "42".parse().unwrap();
        assert_eq!(id, UserId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<ChatId>().is_err());
    }

    #[test]
    fn default_id_is_zero() {
        assert!(MessageId::default().is_zero());
        assert!(!ChatId::new(1).is_zero());
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&UserId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
