//! Conversation relay: request model, upstream dispatch, SSE classification
//! and the continuation state machine that stitches truncated replies.

mod challenge;
mod classify;
mod lines;
mod request;
mod session;
mod sink;
mod upstream;

pub use challenge::{ArkoseTokenClient, ChallengeTokenSource};
pub use classify::{
    EventKind, FINISHED_SUCCESSFULLY, MessageFragment, TRUNCATION_MARKER, TruncationPoint,
    UpstreamEvent, classify,
};
pub use lines::LineReader;
pub use request::{Action, Author, ConversationRequest, Message, MessageContent};
pub use session::{RelayOutcome, RelaySession, RelayState};
pub use sink::{ClientGone, ClientSink, EVENT_STREAM_CONTENT_TYPE};
pub use upstream::{
    ByteStream, HttpUpstream, UpstreamClient, UpstreamResponse, bearer, build_http_client,
};
