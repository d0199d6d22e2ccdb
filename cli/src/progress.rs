// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal rendering of pull/push progress: one bar per blob reference.

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use tonic::Streaming;

use kiln_core::presentation::grpc::images_v1::{ImageProgressResponse, ImageStatus};

const BAR_TEMPLATE: &str = "{prefix:.bold} {msg:12} [{bar:30.cyan/blue}] {bytes}/{total_bytes}";

pub struct ProgressBoard {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            style,
        }
    }

    /// Apply one batch of statuses. Offsets never move a bar backwards.
    pub fn update(&mut self, statuses: &[ImageStatus]) {
        for status in statuses {
            let bar = self.bars.entry(status.r#ref.clone()).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(self.style.clone());
                bar.set_prefix(short_ref(&status.r#ref));
                bar
            });
            let total = u64::try_from(status.total).unwrap_or(0);
            let offset = u64::try_from(status.offset).unwrap_or(0);
            if bar.length() != Some(total) {
                bar.set_length(total);
            }
            if offset > bar.position() {
                bar.set_position(offset);
            }
            if status.status == "done" {
                bar.finish_with_message("done");
            } else {
                bar.set_message(status.status.clone());
            }
        }
    }

    /// Consume `stream` until the server closes it.
    pub async fn follow(&mut self, mut stream: Streaming<ImageProgressResponse>) -> Result<()> {
        while let Some(response) = stream.message().await? {
            self.update(&response.status);
        }
        Ok(())
    }

    pub fn finish(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn position(&self, reference: &str) -> Option<u64> {
        self.bars.get(reference).map(ProgressBar::position)
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// `layer-sha256:0123456789abcdef...` becomes `layer-0123456789ab`.
pub fn short_ref(reference: &str) -> String {
    match reference.split_once("sha256:") {
        Some((prefix, hex)) => format!("{}{}", prefix, &hex[..hex.len().min(12)]),
        None => reference.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(reference: &str, state: &str, offset: i64, total: i64) -> ImageStatus {
        ImageStatus {
            r#ref: reference.to_string(),
            status: state.to_string(),
            offset,
            total,
            ..Default::default()
        }
    }

    #[test]
    fn test_short_ref() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        assert_eq!(short_ref(&format!("layer-{}", digest)), "layer-abababababab");
        assert_eq!(short_ref("manifest-v1"), "manifest-v1");
    }

    #[test]
    fn test_bars_keyed_by_ref_and_monotonic() {
        let mut board = ProgressBoard::with_target(ProgressDrawTarget::hidden());
        board.update(&[
            status("layer-a", "uploading", 40, 100),
            status("config-b", "waiting", 0, 10),
        ]);
        board.update(&[status("layer-a", "uploading", 10, 100)]);
        assert_eq!(board.len(), 2);
        assert_eq!(board.position("layer-a"), Some(40));

        board.update(&[status("layer-a", "done", 100, 100)]);
        assert_eq!(board.position("layer-a"), Some(100));
        board.finish();
    }
}
