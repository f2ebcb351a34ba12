use super::ServerConfig;
use super::merge::merge_config;
use super::validation::validate_config;

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// The .env file is loaded by the binary before this is called.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Environment variables are malformed
    /// - The resulting configuration fails validation
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge_config(None)?;
        validate_config(&config)?;
        Ok(config)
    }
}
