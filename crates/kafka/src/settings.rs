use rdkafka::config::ClientConfig;

use kew_core::errors::KewError;

/// Connection settings for the Kafka cluster.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Broker addresses, comma-separated.
    pub bootstrap_servers: String,
    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL.
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl KafkaSettings {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            security_protocol: "PLAINTEXT".to_string(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }

    /// Read settings from the environment.
    ///
    /// Expected variables:
    /// - KAFKA_BOOTSTRAP_SERVERS: comma-separated broker addresses (required)
    /// - KAFKA_SECURITY_PROTOCOL: defaults to PLAINTEXT
    /// - KAFKA_SASL_MECHANISM / KAFKA_SASL_USERNAME / KAFKA_SASL_PASSWORD
    /// - KAFKA_SSL_CA_LOCATION
    pub fn from_env() -> Result<Self, KewError> {
        dotenv::dotenv().ok();

        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS").map_err(|_| {
            KewError::Config("KAFKA_BOOTSTRAP_SERVERS environment variable must be set".to_string())
        })?;
        let security_protocol = std::env::var("KAFKA_SECURITY_PROTOCOL")
            .unwrap_or_else(|_| "PLAINTEXT".to_string());

        Ok(Self {
            bootstrap_servers,
            security_protocol,
            sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
            sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
        })
    }

    /// Connection block shared by producers, consumers and the admin
    /// client.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("security.protocol", &self.security_protocol);
        if let Some(mechanism) = &self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ca) = &self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }
        config
    }

    pub(crate) fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            // Reliability settings - ensure messages are safely delivered
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", "10")
            .set("retry.backoff.ms", "1000")
            // Performance settings
            .set("compression.type", "zstd")
            .set("batch.size", "65536")
            .set("linger.ms", "5");
        config
    }

    pub(crate) fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", group_id)
            // Start from the beginning when no offset is stored yet.
            .set("auto.offset.reset", "earliest")
            // Offsets are stored explicitly by the workers and committed
            // in the background.
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            // Failure detection
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            // Keep polls responsive
            .set("fetch.min.bytes", "1")
            .set("fetch.wait.max.ms", "500");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test mutates the process environment, so the missing-variable
    // case is checked here too instead of racing in a second test.
    #[test]
    fn from_env_reads_the_connection_settings() {
        unsafe {
            std::env::remove_var("KAFKA_BOOTSTRAP_SERVERS");
        }
        assert!(matches!(
            KafkaSettings::from_env(),
            Err(KewError::Config(_))
        ));

        unsafe {
            std::env::set_var("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092");
            std::env::set_var("KAFKA_SECURITY_PROTOCOL", "SASL_SSL");
            std::env::set_var("KAFKA_SASL_MECHANISM", "PLAIN");
        }

        let settings = KafkaSettings::from_env().expect("settings should parse");
        assert_eq!(settings.bootstrap_servers, "localhost:9092");
        assert_eq!(settings.security_protocol, "SASL_SSL");
        assert_eq!(settings.sasl_mechanism.as_deref(), Some("PLAIN"));

        unsafe {
            std::env::remove_var("KAFKA_SECURITY_PROTOCOL");
            std::env::remove_var("KAFKA_SASL_MECHANISM");
        }
    }
}
