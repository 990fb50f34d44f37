use gateway_controller_core::delivery::Membership;

/// A fixed set of data-plane addresses, configured at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticMembership(Vec<String>);

impl StaticMembership {
    pub fn new(addrs: impl IntoIterator<Item = String>) -> Self {
        let mut addrs = addrs
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>();
        addrs.sort();
        addrs.dedup();
        Self(addrs)
    }
}

#[async_trait::async_trait]
impl Membership for StaticMembership {
    async fn list_dataplane_addresses(&self) -> Vec<String> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normalizes_addresses() {
        let membership = StaticMembership::new(vec![
            " 10.0.0.2:8443".to_string(),
            String::new(),
            "10.0.0.1:8443".to_string(),
            "10.0.0.2:8443".to_string(),
        ]);
        assert_eq!(
            membership.list_dataplane_addresses().await,
            vec!["10.0.0.1:8443", "10.0.0.2:8443"]
        );
    }
}
