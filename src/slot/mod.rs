//! Concurrency limiters sitting between the scheduler and the rest of the
//! pipeline: per-domain request slots (concurrency + politeness delay), the
//! response byte budget, and the item FIFO.

mod item;
mod request;
mod response;

pub use item::{ItemSlot, QueuedItem};
pub use request::RequestSlots;
pub use response::ResponseSlot;
