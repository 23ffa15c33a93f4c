pub mod models;
pub mod repository;
pub mod schema;

use deadpool::managed::BuildError;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub use repository::{PgVideoRepository, VideoRepository};

pub type DbPool = deadpool::managed::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub fn create_pool(database_url: &str, max_connections: usize) -> Result<DbPool, BuildError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(config).max_size(max_connections).build()
}
