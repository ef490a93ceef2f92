//! Request context, call-tree stack, interrupt controller, and chat
//! continuation for the Conductor runtime.

pub mod chat;
pub mod context;
pub mod interrupt;
pub mod stack;

pub use chat::{cache_chat_id, gen_chat_id, resolve_chat_id};
pub use context::{get, register, remove, send_interrupt, Context, StackGuard};
pub use interrupt::{InterruptController, InterruptHandler};
pub use stack::{ForkParent, Stack, StackSnapshot};
