//! rpc-registry cli & logging config

pub mod cli {
    //! Parse from either cli or env var

    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/rpc-registry/config.yaml";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "rpc-registry-worker";
    /// default log level. Can use this argument or REGISTRY_LOG env var
    pub const DEFAULT_REGISTRY_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::path::PathBuf;

    pub use clap::Parser;
    use clap::Subcommand;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "rpc-registry", bin_name = "rpc-registry", about, long_about = None)]
    /// parses from cli & environment var. `.env` in the working dir is loaded as well
    pub struct Config {
        /// path to the registry config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_REGISTRY_LOG)]
        pub registry_log: String,
        /// log format: standard, pretty or json
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        #[clap(subcommand)]
        pub command: Command,
    }

    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// advertise an RPC server until interrupted, then unregister
        Register {
            /// service name
            #[clap(long, short)]
            service: String,
            /// host the server is reachable at
            #[clap(long)]
            host: String,
            /// port the server listens on
            #[clap(long, short)]
            port: u16,
        },
        /// print the addresses registered for a service
        Resolve {
            /// service name
            #[clap(long, short)]
            service: String,
            /// keep printing as membership changes
            #[clap(long, short)]
            follow: bool,
        },
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Logging setup
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(registry_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(registry_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("h2=off".parse()?)
                .add_directive("hyper=off".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
