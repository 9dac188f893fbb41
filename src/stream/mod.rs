//! Generic stream session protocol
//!
//! A stream pulls a contiguous range of an ordered keyspace from one peer
//! in bounded chunks. The [`leecher::Leecher`] drives sessions on the
//! requesting side and the [`seeder::Seeder`] serves them.

pub mod leecher;
pub mod locator;
pub mod payload;
pub mod pump;
pub mod seeder;
pub mod session;

pub use leecher::{Leecher, LeecherCallbacks, LeecherConfig};
pub use locator::{IdLocator, IndexLocator, Locator};
pub use payload::Payload;
pub use pump::{ChunkPump, SessionConfig};
pub use seeder::{Seeder, SeederCallbacks, SeederConfig};
pub use session::{Limit, Request, Response, Session, WireRequest, WireSession};
