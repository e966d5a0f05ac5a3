//! # Messaging
//!
//! Wire format, large-message codec, and the framework queues built on the
//! storage-level message queue primitive.

pub mod codec;
pub mod control_queue;
pub mod message;
pub mod work_item_queue;

pub use codec::{EncodedMessage, LargeMessageCodec};
pub use control_queue::{ControlQueue, EnqueuedMessage};
pub use message::{MessageData, MessageEnvelope, TaskMessage};
pub use work_item_queue::WorkItemQueue;
