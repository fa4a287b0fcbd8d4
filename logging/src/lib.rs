// Copyright (c) 2021-2024 RBB S.r.l
// opensource@mintlayer.org
// SPDX-License-Identifier: MIT
// Licensed under the MIT License;
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://github.com/mintlayer/mintlayer-core/blob/master/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::{IsTerminal, Write},
    sync::Mutex,
};

use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

pub use log;

static INITIALIZE_LOGGER_ONCE_FLAG: std::sync::Once = std::sync::Once::new();

/// Send log output to the terminal.
pub fn init_logging() {
    // Write to stderr to mimic the behavior of env_logger.
    init_logging_impl(std::io::stderr, std::io::stderr().is_terminal());
}

/// Send log output to the specified [Write] instance, log lines are separated by '\n'.
///
/// `is_terminal` determines whether ANSI coloring is used.
pub fn init_logging_to(file: impl Write + Send + 'static, is_terminal: bool) {
    init_logging_impl(Mutex::new(Box::new(file)), is_terminal);
}

/// Initialize the logger at most once; repeated calls are no-ops.
///
/// Filtering is controlled by the RUST_LOG env var, same as with env_logger.
fn init_logging_impl<MW>(make_writer: MW, is_terminal: bool)
where
    MW: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    INITIALIZE_LOGGER_ONCE_FLAG.call_once(move || {
        let logging_layer = tracing_subscriber::fmt::Layer::new()
            .with_writer(make_writer)
            .with_ansi(is_terminal);

        Registry::default()
            .with(logging_layer)
            .with(EnvFilter::from_default_env())
            // This calls tracing::subscriber::set_global_default on self and then initializes a
            // 'log' compatibility layer, so that 'log' macros continue to work (this requires the
            // "tracing-log" feature, which is enabled by default).
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_twice() {
        init_logging();
        init_logging();
    }
}
