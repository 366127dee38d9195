//! `beacon-widgets`: widget instance lifecycle on top of SQLite.
//!
//! [`WidgetCoordinator`] is the entry point for creating, editing and
//! removing instances. The concrete collaborators it is usually wired with
//! live here too: [`SqliteStore`], [`ChaChaCodec`] and [`EventBroadcaster`].

pub mod coordinator;
pub mod db;
pub mod publisher;
pub mod secrets;
pub mod store;

pub use coordinator::WidgetCoordinator;
pub use db::init_db;
pub use publisher::{Audience, Envelope, EventBroadcaster};
pub use secrets::ChaChaCodec;
pub use store::{NewWidget, SqliteStore};
