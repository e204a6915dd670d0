//! Supabase binding for the tidepool sync engine.
//!
//! [`SupabaseClient`] implements [`tidepool::DataSource`] over PostgREST;
//! [`RealtimeSocket`] implements [`tidepool::ChannelFactory`] over the
//! Phoenix-protocol realtime websocket. Wire an engine to a project with
//! both:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidepool::SyncEngine;
//! use tidepool_supabase::{RealtimeSocket, SupabaseClient};
//!
//! let client = Arc::new(SupabaseClient::new("https://proj.supabase.co", "anon-key"));
//! let socket = Arc::new(RealtimeSocket::new(
//!     "wss://proj.supabase.co/realtime/v1/websocket",
//!     "anon-key",
//! ));
//! let engine = SyncEngine::builder(client, socket).build();
//! ```

mod client;
mod error;
mod realtime;

pub use client::SupabaseClient;
pub use error::SupabaseError;
pub use realtime::RealtimeSocket;
