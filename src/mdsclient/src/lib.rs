//! Client-side session and open-file machinery for a metadata-server based distributed file
//! system.
//!
//! The pieces here are the ones that have to be right under concurrency: a state gate that lets
//! readers act against a consistent snapshot while writers drive transitions, the per-server
//! session with its capability release queue, and the open file handle with its FIFO cursor.

mod config;
mod handle;
mod id_list;
mod ids;
mod inode;
mod session;
mod state_ref;
mod sync;
mod util;

pub use config::*;
pub use handle::*;
pub use id_list::*;
pub use ids::*;
pub use inode::*;
pub use session::*;
pub use state_ref::*;
