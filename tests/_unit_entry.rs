// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod unit_tests {
    use fileproto_rs::proto::ProtocolLimits;

    // Shared reference limits for component validation tests.
    pub fn limits() -> ProtocolLimits {
        ProtocolLimits::default()
    }

    // Scratch directory helper for tests that touch the filesystem.
    pub fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fileproto-test-{tag}-{}",
            fileproto_rs::utils::random_hex(8)
        ));
        std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    pub mod test_auth;
    pub mod test_body;
    pub mod test_caches;
    pub mod test_codes;
    pub mod test_credentials;
    pub mod test_header;
    pub mod test_password;
    pub mod test_perms;
    pub mod test_rollover;
    pub mod test_wire;
}
