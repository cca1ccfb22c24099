//! `dock check`: validate a package layout offline.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use dock_runtime::package::PackagePlan;
use dock_runtime::PackageLayout;

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Package to check
    pub repo: String,

    /// Configuration file (JSON or TOML)
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory holding the packages
    #[clap(long)]
    pub packages_root: Option<PathBuf>,
}

/// Implementation of the check command
pub fn execute(args: CheckArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref(), args.packages_root)?;
    let layout = PackageLayout::from_config(&config);
    let plan = layout.plan(&args.repo)?;
    print!("{}", render(&plan));
    Ok(())
}

/// Module table for `plan`.
pub fn render(plan: &PackagePlan) -> String {
    let mut out = format!("Package {} is deployable\n", plan.package);
    out.push_str(&format!("  bundle: {}\n", plan.bundle.display()));
    out.push_str(&format!(
        "  shared initializer: {}\n",
        plan.shared_init.as_deref().unwrap_or("-")
    ));

    let width = plan
        .modules
        .iter()
        .map(|m| m.address.len())
        .max()
        .unwrap_or(0)
        .max("ADDRESS".len());
    out.push_str(&format!("  {:<width$}  CLASS\n", "ADDRESS", width = width));
    for module in &plan.modules {
        out.push_str(&format!(
            "  {:<width$}  {}\n",
            module.address,
            module.class_ref,
            width = width
        ));
    }
    out
}
