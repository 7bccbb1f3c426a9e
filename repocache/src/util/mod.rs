//! Small helpers shared by transports, the pool and the listener.

pub mod http_date;
pub mod mime;

pub use http_date::{format_http_date, parse_http_date, truncate_to_seconds};
pub use mime::content_type_for;
