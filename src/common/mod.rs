pub mod helpers;
pub mod schema;
pub mod value;
