pub mod data;
pub mod http;
pub mod runtime;
pub mod util;
