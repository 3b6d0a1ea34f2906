//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - conversation messages held in memory and handed to the router
//! - anthropic messages/tools, sent from the router to the delegated backend
//! - openai-style messages/tools, sent to the static-key and local backends
//! - tool invocations and outcomes, exchanged with the external tool executor
//!
//! We always immediately convert the wire formats into these internal structs
//! at the provider boundary, so nothing above a provider branches on wire format.
pub mod message;
pub mod role;
pub mod tool;
