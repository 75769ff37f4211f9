mod message_service;


pub use message_service::{
    FanOutError, MessageService, MessageServiceDependencies, RegisteredMessage, HISTORY_PAGE_SIZE,
};
