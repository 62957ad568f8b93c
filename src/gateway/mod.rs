mod onebot;

pub use onebot::{parse_event, serve_events, OneBotGateway};
