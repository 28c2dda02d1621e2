// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate the shipped example configuration.
// Author: Lukas Bower

use std::path::Path;
use std::time::Duration;

use devfarm::ProxyConfig;

#[test]
fn example_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/devfarm.toml");
    let config = ProxyConfig::load(&path).unwrap();
    assert_eq!(config.server.listen, "0.0.0.0:10000");
    assert_eq!(
        config.targets.keys().map(String::as_str).collect::<Vec<_>>(),
        ["k230", "k510"]
    );

    let k230 = &config.targets["k230"];
    assert_eq!(k230.shell_prompt, "]# ");
    assert_eq!(k230.reboot_grace(), Duration::from_secs(20));

    let k510 = &config.targets["k510"];
    assert_eq!(k510.password, "root");
    assert_eq!(k510.exec_timeout(), Duration::from_secs(300));
    assert_eq!(k510.shell_prompt, "# ");
    assert_eq!(k510.results.baud, 115_200);
}

#[test]
fn missing_file_names_the_path() {
    let err = ProxyConfig::load(Path::new("/nonexistent/devfarm.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/devfarm.toml"));
}
