// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! API-key discovery.
//!
//! Resolution order: explicit flag value, then the `WANDB_API_KEY`
//! environment variable, then the `api.wandb.ai` block of the user's netrc
//! file. A missing key is not fatal — the sidecar warns and lets the
//! backend reject unauthenticated traffic itself.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

const API_KEY_ENV: &str = "WANDB_API_KEY";
const NETRC_ENV: &str = "NETRC";
const NETRC_HOST: &str = "api.wandb.ai";

/// Resolves the API key from the standard sources, most explicit first.
pub fn resolve_api_key(explicit: Option<&str>) -> Option<String> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    if let Ok(key) = env::var(API_KEY_ENV) {
        if !key.is_empty() {
            debug!("using API key from {API_KEY_ENV}");
            return Some(key);
        }
    }
    let netrc = netrc_path()?;
    let contents = fs::read_to_string(&netrc).ok()?;
    let key = netrc_password(&contents, NETRC_HOST)?;
    debug!("using API key from {}", netrc.display());
    Some(key)
}

fn netrc_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(NETRC_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let home = env::var("HOME").ok()?;
    let home = Path::new(&home);
    // Prefer ~/.netrc; fall back to the underscore spelling some tools use.
    for name in [".netrc", "_netrc"] {
        let candidate = home.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Extracts the `password` token of the `machine <host>` block.
///
/// netrc is a whitespace-separated token stream: `machine`/`default` start
/// a block, `login`/`password`/`account` pairs follow in any order.
fn netrc_password(contents: &str, host: &str) -> Option<String> {
    let mut tokens = contents.split_whitespace();
    let mut in_matching_machine = false;
    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                in_matching_machine = tokens.next() == Some(host);
            }
            "default" => {
                // A default block matches any host, but an explicit machine
                // block seen earlier already returned.
                in_matching_machine = true;
            }
            "password" if in_matching_machine => {
                return tokens.next().map(str::to_string);
            }
            "login" | "account" | "password" => {
                // Skip the value of a pair we don't care about.
                tokens.next();
            }
            _ => {}
        }
    }
    None
}
