use crate::IncomingRequest;
use bytesstr::BytesStr;

/// Identifies a dialog by the RFC 3261 triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub remote_tag: BytesStr,
}

/// Conflict reported by the dialog engine when a request cannot be taken on
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("a client transaction is still proceeding inside the dialog")]
    ProceedingUac,
    #[error("a server transaction is still proceeding inside the dialog")]
    ProceedingUas,
    #[error("request CSeq is older than the dialog's")]
    OldCSeq,
    #[error("no dialog matches this request")]
    NoDialog,
}

/// Contract between the transaction core and the dialog engine.
///
/// The owning call is suspended while a hook call runs, so implementations
/// must answer promptly and never block.
#[async_trait::async_trait]
pub trait DialogHook: Send + Sync + 'static {
    /// Associate a transaction with a dialog before it enters processing.
    ///
    /// `local_tag` is the tag the transaction will use in its responses; for
    /// dialog-creating requests it becomes the local half of the dialog id.
    async fn dialog_request(
        &self,
        request: &IncomingRequest,
        local_tag: &BytesStr,
    ) -> Result<DialogId, DialogError>;
}

/// Stub used when no dialog engine is attached.
///
/// Associates every request with a dialog id derived from its tags and never
/// reports a conflict.
#[derive(Debug, Default)]
pub struct PermissiveDialog;

#[async_trait::async_trait]
impl DialogHook for PermissiveDialog {
    async fn dialog_request(
        &self,
        request: &IncomingRequest,
        local_tag: &BytesStr,
    ) -> Result<DialogId, DialogError> {
        let base = &request.base_headers;

        Ok(DialogId {
            call_id: base.call_id.clone(),
            local_tag: base.to_tag.clone().unwrap_or_else(|| local_tag.clone()),
            remote_tag: base.from_tag.clone(),
        })
    }
}
