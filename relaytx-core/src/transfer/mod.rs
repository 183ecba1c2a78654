//! Transfer Controller — the sender and receiver state machines that
//! drive one file transfer session over a [`crate::channel::Channel`]
//! (§4.4, §4.5).

pub mod receiver;
pub mod sender;

pub use receiver::{ReceiverController, ReceiverState};
pub use sender::{SenderController, SenderState};
