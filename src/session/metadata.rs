// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::utils::unix_timestamp;

/// Live session state for one user.
///
/// The `token` is the long-lived bearer credential: minted at LOGIN, rotated
/// only by password change or termination. The `refresh_digest` is the
/// rotating secret replaced on every successful refresh; proving continuity
/// with it is the one cryptographic job of the refresh path.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    token: Vec<u8>,
    refresh_digest: Vec<u8>,
    lifespan: Duration,
    last_refresh: f64,
    valid_until: f64,
    iteration: u32,
}

impl SessionMetadata {
    pub fn new(token: Vec<u8>, refresh_digest: Vec<u8>, lifespan: Duration) -> Self {
        let last_refresh = unix_timestamp();
        Self {
            token,
            refresh_digest,
            lifespan,
            last_refresh,
            valid_until: last_refresh + lifespan.as_secs_f64(),
            iteration: 1,
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn refresh_digest(&self) -> &[u8] {
        &self.refresh_digest
    }

    pub fn lifespan(&self) -> Duration {
        self.lifespan
    }

    pub fn last_refresh(&self) -> f64 {
        self.last_refresh
    }

    pub fn valid_until(&self) -> f64 {
        self.valid_until
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.valid_until < now
    }

    /// Installs a freshly minted digest: bumps `last_refresh`, extends
    /// `valid_until` by the lifespan, increments the iteration.
    pub fn update_digest(&mut self, new_digest: Vec<u8>) {
        self.refresh_digest = new_digest;
        self.last_refresh = unix_timestamp();
        self.valid_until = self.last_refresh + self.lifespan.as_secs_f64();
        self.iteration += 1;
    }

    #[cfg(test)]
    pub fn set_last_refresh_for_tests(&mut self, last_refresh: f64) {
        self.last_refresh = last_refresh;
    }

    /// JSON form sent in LOGIN responses (byte fields hex-encoded).
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("token".to_string(), json!(hex::encode(&self.token)));
        map.insert(
            "refresh_digest".to_string(),
            json!(hex::encode(&self.refresh_digest)),
        );
        map.insert("lifespan".to_string(), json!(self.lifespan.as_secs_f64()));
        map.insert("last_refresh".to_string(), json!(self.last_refresh));
        map.insert("valid_until".to_string(), json!(self.valid_until));
        map.insert("iteration".to_string(), json!(self.iteration));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_tracks_last_refresh() {
        let lifespan = Duration::from_secs(600);
        let mut metadata =
            SessionMetadata::new(vec![1; 32], vec![2; 32], lifespan);
        assert_eq!(metadata.iteration(), 1);
        assert!(
            (metadata.valid_until() - metadata.last_refresh()
                - lifespan.as_secs_f64())
            .abs()
                < 1e-9
        );

        let token_before = metadata.token().to_vec();
        metadata.update_digest(vec![3; 32]);
        assert_eq!(metadata.iteration(), 2);
        assert_eq!(metadata.token(), token_before.as_slice());
        assert_eq!(metadata.refresh_digest(), &[3u8; 32]);
        assert!(
            (metadata.valid_until() - metadata.last_refresh()
                - lifespan.as_secs_f64())
            .abs()
                < 1e-9
        );
    }

    #[test]
    fn test_json_map_hex_encodes_secrets() {
        let metadata = SessionMetadata::new(
            vec![0xAB; 4],
            vec![0xCD; 4],
            Duration::from_secs(60),
        );
        let map = metadata.to_json_map();
        assert_eq!(map["token"], json!("abababab"));
        assert_eq!(map["refresh_digest"], json!("cdcdcdcd"));
    }
}
