#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("change publisher failed: {message}")]
    PublishFailed { message: String },
    #[error("change channel closed for user {user}")]
    ChannelClosed { user: String },
}
