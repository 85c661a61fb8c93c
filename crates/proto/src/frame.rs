/// One unit of data moved by a gateway transport.
///
/// Every receive produces a freshly owned `Frame`, so a frame handed to a
/// processing task is never touched by later receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Raw message body (UTF-8 JSON for gateway traffic).
    pub payload: Vec<u8>,
    /// Set on RPC requests and echoed back on their replies.
    pub correlation_id: Option<String>,
    /// Queue the gateway should publish an RPC reply to.
    pub reply_to: Option<String>,
}

impl Frame {
    /// Creates an uncorrelated frame.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Tags the frame as an RPC request expecting a reply on `reply_to`.
    pub fn with_rpc(
        mut self,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Builds the reply to this frame, echoing its correlation id.
    pub fn reply(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: self.correlation_id.clone(),
            reply_to: None,
        }
    }
}
