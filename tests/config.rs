use std::io::Write;

use nova::{AppError, ServerConfig};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("nova-")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// one test so the environment override cannot leak into a parallel load
#[test]
fn file_then_environment() {
    let file = write_config(
        r#"
[network]
ip = "127.0.0.1"
port = 7070
max_connection = 64

[http]
max_body_size = 4096
"#,
    );

    let config = ServerConfig::set_up_config(file.path()).unwrap();
    assert_eq!(config.listen_address(), "127.0.0.1:7070");
    assert_eq!(config.network.max_connection, 64);
    assert_eq!(config.http.max_body_size, 4096);
    // untouched sections keep their defaults
    assert_eq!(config.http.max_header_count, 100);
    assert_eq!(config.websocket.max_payload_size, 10 * 1024 * 1024);

    std::env::set_var("NOVA__NETWORK__PORT", "9090");
    let overridden = ServerConfig::set_up_config(file.path());
    std::env::remove_var("NOVA__NETWORK__PORT");
    assert_eq!(overridden.unwrap().network.port, 9090);
}

#[test]
fn invalid_values_fail_startup() {
    let file = write_config(
        r#"
[http]
max_header_size = 65536
max_total_header_size = 1024
"#,
    );
    assert!(matches!(
        ServerConfig::set_up_config(file.path()),
        Err(AppError::InvalidConfig(_))
    ));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        ServerConfig::set_up_config(missing),
        Err(AppError::ConfigFileError(_))
    ));
}
