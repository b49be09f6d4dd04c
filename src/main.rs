// fabsim: Discrete-Event Simulation of Load Balancing in AI-Training Clos Fabrics
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;

use fabsim::prelude::*;

/// Run one fabric simulation from a JSON configuration record.
#[derive(Debug, Parser)]
#[command(name = "fabsim")]
struct Args {
    /// Path to the configuration record (JSON).
    config: PathBuf,

    /// Directory for the report artifacts; defaults to the working directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<ExitCode> {
    pretty_env_logger::init();
    let args = Args::parse();

    let raw = fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: Config =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?;

    let report = run(&config)?;

    let out_dir = args.out_dir.unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&out_dir)?;
    let ts = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S");
    let report_path = out_dir.join(format!("report_{ts}.json"));
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    log::info!("report written to {}", report_path.display());

    if config.run.file_debug {
        let flows_path = out_dir.join(format!("flows_{ts}.csv"));
        let file = fs::File::create(&flows_path)
            .with_context(|| format!("creating {}", flows_path.display()))?;
        report.write_flow_csv(file)?;
        log::info!("per-flow records written to {}", flows_path.display());
    }

    match &report.status {
        RunStatus::Completed => Ok(ExitCode::SUCCESS),
        RunStatus::Stalled { unfinished } => {
            log::error!("run stalled with unfinished work:");
            for item in unfinished {
                log::error!("  {item}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
