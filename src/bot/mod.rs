/// Command and channel-post handlers
pub mod handlers;
