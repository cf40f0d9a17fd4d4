//! Kubeconfig rendering for components authenticating with client certificates

use crate::ConfigError;
use base64::{engine::general_purpose, Engine as _};

/// Generate a kubeconfig for a client certificate identity.
///
/// `server` may omit the scheme, `https://` is assumed.
pub fn generate_kubeconfig(
    server: &str,
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Result<String, ConfigError> {
    if server.is_empty() {
        return Err(ConfigError::MissingField("server"));
    }
    if ca_cert_pem.is_empty() {
        return Err(ConfigError::MissingField("ca_cert_pem"));
    }
    if client_cert_pem.is_empty() {
        return Err(ConfigError::MissingField("client_cert_pem"));
    }
    if client_key_pem.is_empty() {
        return Err(ConfigError::MissingField("client_key_pem"));
    }

    let server = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{server}")
    };
    let ca_data = general_purpose::STANDARD.encode(ca_cert_pem);
    let cert_data = general_purpose::STANDARD.encode(client_cert_pem);
    let key_data = general_purpose::STANDARD.encode(client_key_pem);

    Ok(format!(
        r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {ca_data}
    server: {server}
  name: k8s
contexts:
- context:
    cluster: k8s
    user: k8s-user
  name: k8s
current-context: k8s
users:
- name: k8s-user
  user:
    client-certificate-data: {cert_data}
    client-key-data: {key_data}
"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_kubeconfig() {
        let kubeconfig = generate_kubeconfig("127.0.0.1:6443", "CA", "CERT", "KEY").unwrap();

        assert!(kubeconfig.contains("server: https://127.0.0.1:6443"));
        assert!(kubeconfig.contains(&format!(
            "certificate-authority-data: {}",
            general_purpose::STANDARD.encode("CA")
        )));
        assert!(kubeconfig.contains(&format!(
            "client-key-data: {}",
            general_purpose::STANDARD.encode("KEY")
        )));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&kubeconfig).unwrap();
        assert_eq!(parsed["current-context"], "k8s");
    }

    #[test]
    fn test_keeps_explicit_scheme() {
        let kubeconfig = generate_kubeconfig("https://api:6443", "CA", "CERT", "KEY").unwrap();
        assert!(kubeconfig.contains("server: https://api:6443\n"));
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            generate_kubeconfig("", "CA", "CERT", "KEY"),
            Err(ConfigError::MissingField("server"))
        ));
        assert!(matches!(
            generate_kubeconfig("api", "", "CERT", "KEY"),
            Err(ConfigError::MissingField("ca_cert_pem"))
        ));
        assert!(matches!(
            generate_kubeconfig("api", "CA", "CERT", ""),
            Err(ConfigError::MissingField("client_key_pem"))
        ));
    }
}
