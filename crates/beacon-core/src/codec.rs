use crate::backend_config::BackendConfig;
use crate::error::Result;
use crate::types::WidgetParam;

/// Encrypt/decrypt capability for single secret values.
///
/// Both directions fail with [`crate::BeaconError::Codec`] on malformed input.
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Encrypt every PASSWORD-typed value of `backend_config`.
///
/// Other values pass through untouched and are never handed to the codec.
/// Blank secrets are left as they are. Every key is kept, empty values
/// included.
pub fn encrypt_secret_params(
    codec: &dyn SecretCodec,
    params: &[WidgetParam],
    backend_config: &str,
) -> Result<String> {
    let mut config = BackendConfig::parse(backend_config);
    for param in params.iter().filter(|p| p.is_secret()) {
        if let Some(value) = non_blank(config.get(&param.name)) {
            let ciphertext = codec.encrypt(value)?;
            config.set(param.name.clone(), ciphertext);
        }
    }
    Ok(config.to_text())
}

/// Decrypt every PASSWORD-typed value of `backend_config`.
///
/// Entries left empty are dropped from the result.
pub fn decrypt_secret_params(
    codec: &dyn SecretCodec,
    params: &[WidgetParam],
    backend_config: &str,
) -> Result<BackendConfig> {
    let mut config = BackendConfig::parse(backend_config);
    for param in params.iter().filter(|p| p.is_secret()) {
        if let Some(value) = non_blank(config.get(&param.name)) {
            let plaintext = codec.decrypt(value)?;
            config.set(param.name.clone(), plaintext);
        }
    }
    Ok(config.without_empty())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
