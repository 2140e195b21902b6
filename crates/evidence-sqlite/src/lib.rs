mod open;
mod models;
mod insert;
mod query;
mod schema;
mod store;
mod export;

pub use open::Db;
pub use models::*;
pub use insert::*;
pub use query::*;
pub use export::*;
