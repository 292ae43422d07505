pub mod budget;
pub mod quota;

pub use budget::*;
pub use quota::*;
