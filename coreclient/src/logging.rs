// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, registry,
    util::SubscriberInitExt};

static INIT_LOGGER_ONCE: Once = Once::new();

/// Install the global tracing subscriber with the given default level. The
/// `RUST_LOG` environment variable still takes precedence. Only the first
/// call has an effect.
pub(crate) fn init_logger(default_level: LevelFilter) {
    INIT_LOGGER_ONCE.call_once(|| {
        let env_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();
        let _ = registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
            .try_init();
    });
}
