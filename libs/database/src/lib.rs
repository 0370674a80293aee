//! Connection management for the PostgreSQL and Redis backends.
//!
//! # Features
//!
//! - `postgres` (default) - PostgreSQL support with SeaORM and migrations
//! - `redis` (default) - Redis `ConnectionManager` support
//!
//! Both backends read their settings through `core_config::FromEnv` and connect
//! with exponential backoff from [`common::retry`].
//!
//! ```ignore
//! use database::{postgres, redis};
//! use core_config::FromEnv;
//!
//! let db = postgres::connect_from_config_with_retry(postgres::PostgresConfig::from_env()?, None).await?;
//! postgres::run_migrations::<migration::Migrator>(&db, "embedding-worker").await?;
//! let conn = redis::connect_from_config_with_retry(redis::RedisConfig::from_env()?, None).await?;
//! ```

pub mod common;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use common::{DatabaseError, DatabaseResult};
