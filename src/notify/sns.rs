// SNS topic sink

use super::{EventSink, NotificationEvent, NotifyError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::error::{DisplayErrorContext, SdkError};
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client;

/// Publishes events as JSON messages to an SNS topic
pub struct SnsTopic {
    client: Client,
    topic_arn: String,
}

impl SnsTopic {
    /// Connect with the default credential chain
    pub async fn new(topic_arn: impl Into<String>, region: impl Into<String>) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_types::region::Region::new(region.into()))
            .load()
            .await;
        Self {
            client: Client::new(&aws_config),
            topic_arn: topic_arn.into(),
        }
    }
}

fn classify<E>(err: SdkError<E>) -> NotifyError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = DisplayErrorContext(&err).to_string();
    match (&err, status) {
        (SdkError::TimeoutError(_), _) | (SdkError::DispatchFailure(_), _) => NotifyError::Transient(message),
        (_, Some(code)) if code == 429 || code >= 500 => NotifyError::Transient(message),
        _ => NotifyError::Permanent(message),
    }
}

#[async_trait]
impl EventSink for SnsTopic {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_string(event).map_err(|e| NotifyError::Permanent(e.to_string()))?;
        let event_type = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(event.event_type.as_str())
            .build()
            .map_err(|e| NotifyError::Permanent(e.to_string()))?;

        self.client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(format!("{} {}", event.event_type, event.key.as_deref().unwrap_or("")).trim().to_string())
            .message(body)
            .message_attributes("type", event_type)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
