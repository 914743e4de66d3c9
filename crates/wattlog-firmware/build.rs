//! Injects Wi-Fi credentials and the collector endpoint at compile time.
//!
//! Values come from the process environment or a `.env` file found in this
//! crate or any parent directory:
//!
//! ```text
//! WIFI_SSID=...
//! WIFI_PASSWORD=...
//! COLLECTOR_HOST=192.168.1.10
//! COLLECTOR_PORT=8000
//! ```

use std::env;

const REQUIRED: [&str; 3] = ["WIFI_SSID", "WIFI_PASSWORD", "COLLECTOR_HOST"];

fn main() {
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    if let Ok(path) = dotenvy::dotenv() {
        println!("cargo:rerun-if-changed={}", path.display());
    }
    for key in REQUIRED.iter().chain(["COLLECTOR_PORT"].iter()) {
        println!("cargo:rerun-if-env-changed={key}");
    }

    for key in REQUIRED {
        match env::var(key) {
            Ok(value) => println!("cargo:rustc-env={key}={value}"),
            Err(_) => {
                eprintln!("error: {key} is not set. Add it to .env or the environment.");
                std::process::exit(1);
            }
        }
    }

    let port = env::var("COLLECTOR_PORT").unwrap_or_else(|_| "8000".to_string());
    println!("cargo:rustc-env=COLLECTOR_PORT={port}");
}
