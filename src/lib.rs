pub mod comm;
pub mod util;
