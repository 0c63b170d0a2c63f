//! Per-run namespaces: naming and ownership.

use std::sync::Arc;

use rand::Rng;

use crate::{
    Error,
    cluster::ClusterHandle,
    internal_events::{NamespaceCreated, NamespaceDeleted},
};

pub const PREFIX: &str = "testpods";
const SUFFIX_LENGTH: usize = 5;
const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
/// Kubernetes limit for namespace names.
pub const MAX_LENGTH: usize = 63;

/// Lowercases, maps anything outside `[a-z0-9]` to `-`, collapses runs of
/// dashes and trims them from both ends.
pub fn sanitize(input: &str) -> String {
    let mut sanitized = String::with_capacity(input.len());
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            sanitized.push(c);
        } else if !sanitized.is_empty() && !sanitized.ends_with('-') {
            sanitized.push('-');
        }
    }
    while sanitized.ends_with('-') {
        sanitized.pop();
    }
    sanitized
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LENGTH)
        .map(|_| char::from(SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())]))
        .collect()
}

/// `testpods-<context>-<suffix>`, or `testpods-<suffix>` without a usable
/// context, truncating the context so the name fits the length limit.
pub fn generate(context: Option<&str>) -> String {
    let suffix = random_suffix();
    let context = context.map(sanitize).unwrap_or_default();
    if context.is_empty() {
        return format!("{}-{}", PREFIX, suffix);
    }
    let available = MAX_LENGTH - PREFIX.len() - SUFFIX_LENGTH - 2;
    let context = context[..context.len().min(available)].trim_end_matches('-');
    format!("{}-{}-{}", PREFIX, context, suffix)
}

/// A namespace used by one run. Only deleted on close if this instance
/// created it.
pub struct TestNamespace {
    cluster: Arc<dyn ClusterHandle>,
    name: String,
    created: bool,
}

impl TestNamespace {
    pub fn new(cluster: Arc<dyn ClusterHandle>, name: impl Into<String>) -> Self {
        Self {
            cluster,
            name: name.into(),
            created: false,
        }
    }

    pub fn generated(cluster: Arc<dyn ClusterHandle>, context: Option<&str>) -> Self {
        Self::new(cluster, generate(context))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Creates the namespace unless it already exists.
    pub async fn create(&mut self) -> Result<(), Error> {
        if self.created {
            return Ok(());
        }
        self.created = self.cluster.ensure_namespace(&self.name).await?;
        if self.created {
            emit!(NamespaceCreated { name: &self.name });
        } else {
            debug!(message = "Using existing namespace.", namespace = %self.name);
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        if !self.created {
            return Ok(());
        }
        let existed = self.cluster.delete_namespace(&self.name).await?;
        self.created = false;
        emit!(NamespaceDeleted {
            name: &self.name,
            existed
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::AccessStrategy,
        test_util::{FakeCluster, Operation},
    };

    #[test]
    fn sanitizes_context() {
        assert_eq!(sanitize("MyIntegrationTest"), "myintegrationtest");
        assert_eq!(sanitize("--Order_Service  IT--"), "order-service-it");
        assert_eq!(sanitize("a..b"), "a-b");
        assert_eq!(sanitize("__"), "");
    }

    #[test]
    fn generated_names_are_valid() {
        let plain = generate(None);
        assert!(plain.starts_with("testpods-"));
        assert_eq!(plain.len(), PREFIX.len() + 1 + SUFFIX_LENGTH);

        let named = generate(Some("OrderServiceIT"));
        assert!(named.starts_with("testpods-orderserviceit-"));

        let long = generate(Some(&"x".repeat(200)));
        assert_eq!(long.len(), MAX_LENGTH);
        assert!(
            long.chars()
                .all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_ne!(generate(None), generate(None));
    }

    #[tokio::test]
    async fn deletes_only_what_it_created() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let mut owned = TestNamespace::new(Arc::new(cluster.clone()), "testpods-owned");
        owned.create().await.unwrap();
        owned.create().await.unwrap();
        assert!(owned.is_created());

        let mut borrowed = TestNamespace::new(Arc::new(cluster.clone()), "testpods-owned");
        borrowed.create().await.unwrap();
        assert!(!borrowed.is_created());
        borrowed.close().await.unwrap();
        assert!(cluster.has_namespace("testpods-owned"));

        owned.close().await.unwrap();
        owned.close().await.unwrap();
        assert!(!cluster.has_namespace("testpods-owned"));
        similar_asserts::assert_eq!(
            cluster.operations(),
            vec![
                Operation::CreateNamespace("testpods-owned".into()),
                Operation::DeleteNamespace("testpods-owned".into()),
            ]
        );
    }
}
