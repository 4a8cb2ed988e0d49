#![allow(dead_code)]

/// Backend-gated tests run only when `OXGATE_TEST_POSTGRES_URL` points at a
/// PostgreSQL server carrying the document extension.
pub struct TestDb {
    pub url: String,
}

impl TestDb {
    pub fn provision_from_env() -> Option<TestDb> {
        std::env::var("OXGATE_TEST_POSTGRES_URL")
            .ok()
            .map(|url| TestDb { url })
    }
}
