use std::fs;
use std::path::Path;

/// Value of a `#define NAME "value"` or `#define NAME value` line.
fn define_value(contents: &str, name: &str) -> Option<String> {
    let marker = format!("#define {}", name);
    let line = contents.lines().find(|l| {
        l.trim_start()
            .strip_prefix(&marker)
            .map_or(false, |rest| rest.starts_with(char::is_whitespace))
    })?;

    if let Some(quoted) = line.split('"').nth(1) {
        return Some(quoted.to_string());
    }
    line.split_whitespace().nth(2).map(str::to_string)
}

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");

    // Compiled-in network defaults, overridable at runtime from NVS
    let wifi_config_path = "wifi_config.h";
    println!("cargo:rerun-if-changed={}", wifi_config_path);

    let contents = if Path::new(wifi_config_path).exists() {
        fs::read_to_string(wifi_config_path)?
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
        String::new()
    };

    for name in ["WIFI_SSID", "WIFI_PASSWORD", "OTA_PASSWORD"] {
        let value = define_value(&contents, name).unwrap_or_default();
        println!("cargo:rustc-env={}={}", name, value);
    }

    // Numeric octets are checked here so a typo fails the build, not the boot
    for (name, fallback) in [("IP_GROUP", "1"), ("IP_TAIL", "10")] {
        let value = define_value(&contents, name).unwrap_or_else(|| fallback.to_string());
        if value.parse::<u8>().is_err() {
            anyhow::bail!("{} in wifi_config.h must be 0..=255, got '{}'", name, value);
        }
        println!("cargo:rustc-env={}={}", name, value);
    }

    Ok(())
}
