use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod activity;
mod catalog;
mod cli;
mod config;
mod context;
mod distance;
mod eid;
mod errors;
mod jobs;
mod ranking;
mod semantic;
mod service;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use catalog::GeoPoint;
use cli::LocationArgs;
use config::Config;
use context::AppContext;
use semantic::ImageSource;
use service::RecommendationService;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn origin(location: &LocationArgs) -> GeoPoint {
    GeoPoint {
        lat: location.lat,
        lng: location.lng,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    #[cfg(feature = "markdown-docs")]
    if let cli::Command::MarkdownDocs {} = args.command {
        clap_markdown::print_help_markdown::<cli::Args>();
        return Ok(());
    }

    let base_path = context::default_base_path()?;
    let config = Config::load_with(&base_path)?;
    let ctx = AppContext::init(config)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => Ok(()),

        cli::Command::Provision {} => {
            ctx.provision()?;
            log::info!("vector collections are ready");
            Ok(())
        }

        cli::Command::Serve {} => {
            if let Err(err) = ctx.provision() {
                // searches fail with store-unavailable until the store is back
                log::error!("failed to provision vector collections: {err}");
            }
            let service = RecommendationService::new(ctx)?;
            web::start_daemon(service)
        }

        cli::Command::Reindex {} => {
            ctx.provision()?;
            let service = RecommendationService::new(ctx)?;

            let total = service.context().catalog.list()?.len();
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")?
                    .progress_chars("=> "),
            );

            let report = service.reindex(|entity, outcome| {
                bar.set_message(entity.name.clone());
                if let Err(err) = outcome {
                    bar.println(format!("entity {}: {err}", entity.id));
                }
                bar.inc(1);
            })?;
            bar.finish_and_clear();

            service.shutdown();
            print_json(&report)
        }

        cli::Command::Search { query, user_args } => {
            let service = RecommendationService::new(ctx)?;
            let response = service.text_search(&user_args.user, &query)?;
            service.shutdown();
            print_json(&response)
        }

        cli::Command::ImageSearch {
            image,
            no_wait,
            user_args,
        } => {
            let service = RecommendationService::new(ctx)?;
            let source = ImageSource::parse(&image).map_err(errors::CoreError::from)?;
            let job_id = service.enqueue_image_search(&user_args.user, source, false)?;

            if no_wait {
                println!("{job_id}");
                service.shutdown();
                return Ok(());
            }

            let view = loop {
                let view = service.get_job(&job_id)?;
                if view.state == "completed" || view.state == "failed" {
                    break view;
                }
                std::thread::sleep(JOB_POLL_INTERVAL);
            };

            service.shutdown();
            print_json(&view)
        }

        cli::Command::Job { id } => {
            let service = RecommendationService::new(ctx)?;
            let view = service.get_job(&id);
            service.shutdown();
            print_json(&view?)
        }

        cli::Command::Nearby { location } => {
            let service = RecommendationService::new(ctx)?;
            let results =
                service.recommended_near(&location.user_args.user, origin(&location))?;
            service.shutdown();
            print_json(&results)
        }

        cli::Command::Categories { location } => {
            let service = RecommendationService::new(ctx)?;
            let ranking =
                service.recommended_categories(&location.user_args.user, origin(&location))?;
            service.shutdown();
            print_json(&ranking)
        }
    }
}
