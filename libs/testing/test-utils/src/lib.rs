//! Shared test infrastructure
//!
//! - `TestDatabase`: migrated PostgreSQL container (feature: "postgres", default)
//! - `TestRedis`: Redis container with a `ConnectionManager` (feature: "redis")
//! - `TestDataBuilder`: deterministic ids and vectors seeded from the test name
//!
//! Container-backed tests need Docker and are marked `#[ignore]`:
//!
//! ```rust,ignore
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn stores_vectors() {
//!     let db = TestDatabase::new().await;
//!     let builder = TestDataBuilder::from_test_name("stores_vectors");
//!     let owner = builder.owner_id();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Deterministic test data, so a failing test reproduces with the same ids.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// The acting user.
    pub fn owner_id(&self) -> Uuid {
        self.id(0)
    }

    /// The `n`th catalog entity.
    pub fn entity_id(&self, n: u64) -> Uuid {
        self.id(n + 1)
    }

    fn id(&self, salt: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..].copy_from_slice(&salt.to_le_bytes());
        Uuid::from_bytes(bytes)
    }

    /// A unit vector of `dimension` with all its weight on one axis.
    pub fn axis_vector(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis % dimension.max(1)] = 1.0;
        v
    }
}

pub mod assertions {
    /// Assert that a vector has unit length within `1e-4`.
    pub fn assert_unit(vector: &[f32], context: &str) {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 1e-4,
            "{}: expected unit vector, got magnitude {}",
            context,
            norm
        );
    }

    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
