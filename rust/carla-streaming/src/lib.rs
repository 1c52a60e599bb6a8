//! One-producer / many-consumer frame streaming over shared memory.
//!
//! A server process publishes variable-sized binary frames into per-stream
//! broadcasters; client processes on the same host subscribe over TCP, learn
//! the stream's shared-memory channel name, and from then on receive every
//! frame straight out of shared memory — the socket never carries payload
//! bytes.
//!
//! # Data flow
//!
//! ```text
//! producer ─► StreamBroadcaster::publish ─► ShmChannel::write_frame
//!                                                 │ (notify_all)
//!                   ClientReader callback ◄── ShmChannelReader::read_frame
//! ```
//!
//! The channel is latest-value: a reader that falls behind skips to the most
//! recent frame rather than queueing. Delivery is lossy by design; ordering
//! within a stream follows the publish order.
//!
//! # Server side
//!
//! ```ignore
//! let server = Arc::new(Server::bind("127.0.0.1:2000".parse()?).await?);
//! let broadcaster = server.make_stream(StreamId::new(42));
//! tokio::spawn({ let s = server.clone(); async move { s.run().await } });
//!
//! broadcaster.publish(&Frame::message([sensor_bytes]));
//! ```
//!
//! # Client side
//!
//! ```ignore
//! let reader = ClientReader::subscribe(token, |frame| {
//!     // frame is a pooled buffer with one payload
//! });
//! ```

pub mod broadcaster;
pub mod client;
pub mod error;
pub mod frame;
pub mod pool;
pub mod server;
pub mod session;
pub mod token;
pub mod types;

pub use broadcaster::{BroadcasterSnapshot, StreamBroadcaster};
pub use client::ClientReader;
pub use error::StreamError;
pub use frame::Frame;
pub use pool::{Buffer, BufferPool};
pub use server::{Server, StreamMap};
pub use session::Session;
pub use token::{Token, TokenError, TOKEN_WIRE_SIZE};
pub use types::{channel_name, StreamId};
