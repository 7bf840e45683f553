use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use high_detector::analysis::Analyzer;
use high_detector::config::Settings;
use high_detector::server::routes;
use high_detector::util::init_tracing;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./high-detector [config file]";

fn get_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        println!("{USAGE}");
        process::exit(1);
    }

    args.get(1).cloned()
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_file = get_args();

    // A missing API key stops the server here rather than on the first request
    let settings = Settings::load(config_file.as_deref()).context("invalid configuration")?;
    info!(?settings, "loaded configuration");

    let analyzer = web::Data::new(Analyzer::from_settings(&settings)?);
    let body_limit = settings.max_body_bytes;

    info!("listening on {}:{}", settings.host, settings.port);

    HttpServer::new(move || {
        App::new()
            .app_data(analyzer.clone())
            .app_data(routes::json_config(body_limit))
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await?;

    Ok(())
}
