pub mod post;
pub mod search;

pub use post::Post;
pub use search::{parse_terms, Search};
