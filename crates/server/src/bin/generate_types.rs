use std::{env, fs, path::PathBuf};

use deployment::Deployment;
use server::{
    DeploymentImpl,
    error::ApiError,
    routes::{
        health::HealthInfo,
        workflows::{FailWorkflowRequest, StepResultRequest},
    },
};
use ts_rs::TS;

fn generate_types_content() -> String {
    let mut decls = DeploymentImpl::shared_types();
    decls.push(HealthInfo::decl());
    decls.push(StepResultRequest::decl());
    decls.push(FailWorkflowRequest::decl());
    decls.push(ApiError::decl());

    let body = decls
        .into_iter()
        .map(|decl| {
            let trimmed = decl.trim_start();
            if trimmed.starts_with("export") {
                trimmed.to_string()
            } else {
                format!("export {trimmed}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "// This file was generated by `generate_types`. Do not edit it manually.\n\n{body}\n"
    )
}

fn main() -> std::io::Result<()> {
    let out: PathBuf = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shared/types.ts"));
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&out, generate_types_content())?;
    println!("Wrote {}", out.display());
    Ok(())
}
