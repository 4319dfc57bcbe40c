//! Project listing and live status commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::{StyledObject, style};

use devdock::config::DevdockConfig;
use devdock::dashboard::compose::ComposeClient;
use devdock::dashboard::executor::SystemExecutor;
use devdock::dashboard::hosts::read_managed;
use devdock::dashboard::models::{ProjectRecord, ProjectStatus};
use devdock::dashboard::status::{ComposeStatusProbe, StatusProbe};
use devdock::dashboard::store::ProjectStore;

fn styled_status(status: ProjectStatus) -> StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        ProjectStatus::Running => text.green(),
        ProjectStatus::Ready | ProjectStatus::Stopped => text.dim(),
        ProjectStatus::Creating | ProjectStatus::Stopping => text.yellow(),
        ProjectStatus::Error => text.red(),
    }
}

fn format_ports(record: &ProjectRecord) -> String {
    record
        .ports
        .iter()
        .map(|(service, port)| format!("{}:{}", service, port))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn cmd_list(config: &DevdockConfig, json: bool) -> Result<()> {
    let projects = ProjectStore::load(&config.projects_file());

    if json {
        println!("{}", serde_json::to_string_pretty(&projects)?);
        return Ok(());
    }

    if projects.is_empty() {
        println!();
        println!("No projects found in {}", config.projects_file().display());
        println!("Run 'devdock serve' and create one from the dashboard.");
        println!();
        return Ok(());
    }

    println!();
    println!("{:<24} {:<8} {:<10} Ports", "Name", "Template", "Status");
    println!(
        "{:<24} {:<8} {:<10} -----",
        "------------------------", "--------", "----------"
    );
    for project in &projects {
        println!(
            "{:<24} {:<8} {:<10} {}",
            project.name,
            project.template,
            styled_status(project.status),
            format_ports(project)
        );
    }
    println!();
    println!("{} project(s)", projects.len());
    println!();
    Ok(())
}

pub async fn cmd_status(config: &DevdockConfig, name: &str) -> Result<()> {
    let projects = ProjectStore::load(&config.projects_file());
    let record = projects
        .into_iter()
        .find(|p| p.name == name)
        .with_context(|| format!("Project '{}' not found", name))?;

    println!();
    println!("{}", style(&record.name).bold().cyan());
    println!("  Template:  {}", record.template);
    println!("  Path:      {}", record.path.display());
    println!("  Ports:     {}", format_ports(&record));
    println!("  Recorded:  {}", styled_status(record.status));
    if let Some(url) = record.app_url() {
        println!("  URL:       {}", url);
    }
    if let Some(error) = &record.error {
        println!("  Error:     {}", style(error).red());
    }

    let compose = ComposeClient::new(Arc::new(SystemExecutor), &config.docker);
    match ComposeStatusProbe::new(compose).probe(&record).await {
        Ok(probe) => {
            println!("  Live:      {}", styled_status(probe.status));
            println!();
            for container in &probe.containers {
                println!(
                    "  {:<16} {:<10} {}",
                    container.service,
                    container.state.as_str(),
                    container.status_text.as_deref().unwrap_or("")
                );
            }
        }
        Err(e) => {
            println!("  Live:      {}", style(format!("unavailable ({})", e)).yellow());
        }
    }

    let domains: Vec<_> = read_managed(&config.paths.hosts_file)?
        .into_iter()
        .filter(|m| m.project.as_deref() == Some(record.name.as_str()))
        .collect();
    if !domains.is_empty() {
        println!();
        println!("  Domains:");
        for mapping in domains {
            println!("    {} -> {}", mapping.domain, mapping.ip);
        }
    }
    println!();
    Ok(())
}
