//! Terminal capture client: uploads a photo to a running analysis server and
//! prints the verdict

use anyhow::{anyhow, Context, Result};
use high_detector::capture::{
    data_url_from_bytes, CaptureSession, CaptureState, HttpAnalysisApi, NoCamera,
};
use high_detector::util::init_tracing;
use std::{env, fs, process};

const USAGE: &str = "usage: ./capture <server url> <image file>";

fn get_args() -> (String, String) {
    let args: Vec<String> = env::args().collect();
    if args.len() - 1 != 2 {
        println!("{USAGE}");
        process::exit(1);
    }

    (args[1].clone(), args[2].clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let (server, path) = get_args();
    let bytes = fs::read(&path).with_context(|| format!("could not read {path}"))?;

    let api = HttpAnalysisApi::new(&server);
    let mut session = CaptureSession::new(NoCamera);
    session.select_file(data_url_from_bytes(&bytes))?;

    session.analyze(&api).await;

    match session.state() {
        CaptureState::ResultReady { result, .. } => {
            if result.no_face_detected {
                println!("no face found");
            }
            println!("score: {}/100", result.score);
            println!("{}", result.analysis);
            Ok(())
        }
        _ => {
            let notice = session.notice().unwrap_or("analysis did not complete");
            match session.last_error() {
                Some(detail) => Err(anyhow!("{notice} ({detail})")),
                None => Err(anyhow!("{notice}")),
            }
        }
    }
}
