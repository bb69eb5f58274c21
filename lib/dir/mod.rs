//! Directory read buffers and the cookie cache.
//!
//! Directory enumeration resumes at opaque, server-defined cookies. The
//! client packs fetched entries into fixed-capacity logical blocks and
//! remembers which cookie starts which block, so a caller handing back a
//! cookie from an earlier page can be routed to cached data (or to the
//! right restart point) without guessing at the cookie's structure.

mod buffer;
mod cookies;

pub use buffer::{DirBuffer, DirEntry};
pub use cookies::{CookieCache, DirWindow, FillOutcome, ReaddirPage, ReaddirSource, Resolution};
