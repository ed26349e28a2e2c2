//! Transport plumbing for an embedded agent.
//!
//! # Crate Structure
//!
//! - [`asyncreq`]: worker pool that runs blocking system calls off the event loop
//! - [`frame`]: escape-coded message framing over a circular input buffer
//! - [`transport`]: TCP channels tying the two together on one event loop

/// Re-export worker pool types.
pub mod asyncreq {
    pub use agentlink_asyncreq::*;
}

/// Re-export framing types.
pub mod frame {
    pub use agentlink_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use agentlink_transport::*;
}
