pub mod error;
pub mod link;
pub mod probe;
pub mod remark;
pub mod result;
pub mod xray;

pub use error::{DecodeError, ProbeError};
pub use link::{
    CandidateLink, CanonicalKey, Identity, LinkExtractor, ParsedEndpoint, Scheme,
    TransportParams, decode,
};
pub use probe::{ProbeOptions, Prober, Verifier};
pub use remark::{new_label, rewrite_remark, rewrite_with_label};
pub use result::VerificationOutcome;
pub use xray::{EngineConfig, synthesize};
