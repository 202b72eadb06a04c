//! Churn: datagram obfuscation and negotiation rewriting
//!
//! Datagrams of the peer transport are passed through a reversible
//! [`Transformer`] inside an [`ObfuscationPipe`], and host candidates in
//! negotiation descriptions are rewritten so the peers only ever dial each
//! other's obfuscated endpoints.

mod candidate;
mod pipe;
mod relay;
mod signaller;
mod transformer;

pub use candidate::{
    append_line, candidate_lines, extract_endpoint_from_candidate_line, filter_candidates_from_sdp,
    first_host_candidate, is_candidate_line, set_candidate_line_endpoint, CANDIDATE_LINE_PREFIX,
};
pub use pipe::ObfuscationPipe;
pub use relay::ChurnRelay;
pub use signaller::{ChurnSignaller, ChurnTransport};
pub use transformer::{create_transformer, Caesar, ChaCha20, Passthrough, Transformer};
