//! Topic-based publish/subscribe over TCP with multi-part frames.
//!
//! Wire layout per message: frame 1 is the ASCII topic label, frame 2 the
//! JSON body, each frame prefixed with a `u32` big-endian length.  The
//! publisher binds and fans out; the last-value-caching proxy subscribes
//! upstream, re-publishes downstream, and replays the most recent message to
//! every late joiner; subscribers connect with automatic reconnect.

pub mod frame;
pub mod proxy;
pub mod publisher;
pub mod subscriber;

pub use proxy::Proxy;
pub use publisher::Publisher;
pub use subscriber::Subscription;
