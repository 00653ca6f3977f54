use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use console::style;
use stowage::bundle::JsonLoader;
use stowage::imagestore::{ConstructionMode, TransportBinding, new_constructor};
use stowage::packager::{ImportSummary, Importer};
use stowage::registry::progress::{IndicatifProgress, ProgressTracker};
use stowage::registry::{HttpTransportProvider, TransportProvider};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::{Result, StowageCliError};
use crate::home::Home;
use crate::utils;

/// Unpacks a bundle archive into a directory. Thick archives are detected
/// from their contents. With --target every image is pushed under the given
/// registry prefix and the mapping is written to relocation-mapping.json.
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Archive produced by `stowage export`
    pub archive: PathBuf,
    /// Directory to unpack into; defaults to the archive name without extension
    #[arg(short, long)]
    pub destination: Option<PathBuf>,
    /// Registry prefix to relocate images to, e.g. registry.example.com/mirror
    #[arg(long)]
    pub target: Option<String>,
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
    /// CA certificate for verifying registry TLS certificates (repeatable)
    #[arg(long = "ca-cert-path", value_name = "PATH")]
    pub ca_cert_paths: Vec<PathBuf>,
    /// Skip TLS certificate verification for registries
    #[arg(long)]
    pub skip_tls_verify: bool,
}

pub struct ImportCmd {
    pub args: ImportArgs,
    pub home: Home,
    pub concurrency: usize,
    pub progress: Option<Arc<IndicatifProgress>>,
    pub transport_provider: Arc<dyn TransportProvider>,
}

impl ImportCmd {
    pub fn new(args: ImportArgs, home: Home) -> Self {
        Self {
            args,
            home,
            concurrency: config::get_concurrency(),
            progress: None,
            transport_provider: Arc::new(HttpTransportProvider),
        }
    }

    fn destination(&self) -> Result<PathBuf> {
        if let Some(destination) = &self.args.destination {
            return Ok(destination.clone());
        }
        default_destination(&self.args.archive)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ImportSummary> {
        if !self.args.archive.is_file() {
            return Err(StowageCliError::NotFound(format!(
                "archive {}",
                self.args.archive.display()
            )));
        }

        let constructor = TransportBinding::new(
            self.transport_provider.clone(),
            self.args.ca_cert_paths.clone(),
            self.args.skip_tls_verify,
            new_constructor(ConstructionMode::Locating),
        );
        let mut importer = Importer::new(
            &self.args.archive,
            self.destination()?,
            &self.home.logs(),
            Box::new(JsonLoader),
        )?
        .with_constructor(Box::new(constructor))
        .with_concurrency(self.concurrency);
        if let Some(target) = &self.args.target {
            importer = importer.with_target(target.clone());
        }
        if let Some(progress) = &self.progress {
            importer = importer.with_progress(progress.clone() as Arc<dyn ProgressTracker>);
        }

        let result = importer.import(cancel).await;
        if self.args.verbose {
            println!("Import logs: {}", importer.logs().display());
        }
        Ok(result?)
    }
}

/// `dir/foo-1.0.0.tgz` unpacks into `dir/foo-1.0.0`.
fn default_destination(archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StowageCliError::Input(format!("invalid archive path {}", archive.display()))
        })?;
    let stem = [".tar.gz", ".tgz"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name);
    if stem.is_empty() || stem == name {
        return Err(StowageCliError::Input(format!(
            "cannot derive a destination from {}; pass --destination",
            archive.display()
        )));
    }
    Ok(archive.with_file_name(stem))
}

pub async fn execute(args: ImportArgs, cancel: &CancellationToken) -> Result<()> {
    if args.skip_tls_verify {
        utils::print_warning("TLS certificate verification is disabled");
    }
    let progress = Arc::new(IndicatifProgress::new());
    let pb = progress
        .multi()
        .add(utils::spinner(&format!("Importing {}...", args.archive.display())));

    let mut cmd = ImportCmd::new(args, Home::new(config::get_stowage_home()));
    cmd.progress = Some(progress);
    let result = cmd.run(cancel).await;
    pb.finish_and_clear();

    let summary = result?;
    utils::print_success(&format!(
        "Imported {} {} into {}",
        summary.bundle.name,
        summary.bundle.version,
        style(summary.destination.display()).cyan()
    ));
    if summary.thin {
        utils::print_info("Thin bundle: images stay in their original registries");
    }
    for (original, relocated) in &summary.relocations {
        utils::print_info(&format!("{original} -> {relocated}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use stowage::packager::write_archive;

    use super::*;

    #[test]
    fn destination_defaults_to_archive_stem() {
        assert_eq!(
            default_destination(Path::new("out/foo-1.0.0.tgz")).unwrap(),
            PathBuf::from("out/foo-1.0.0")
        );
        assert_eq!(
            default_destination(Path::new("foo.tar.gz")).unwrap(),
            PathBuf::from("foo")
        );
        assert!(matches!(
            default_destination(Path::new("foo")),
            Err(StowageCliError::Input(_))
        ));
    }

    #[tokio::test]
    async fn missing_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = ImportCmd::new(
            ImportArgs {
                archive: dir.path().join("absent.tgz"),
                destination: None,
                target: None,
                verbose: false,
                ca_cert_paths: Vec::new(),
                skip_tls_verify: false,
            },
            Home::new(dir.path()),
        );

        assert!(matches!(
            cmd.run(&CancellationToken::new()).await,
            Err(StowageCliError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn thin_archive_unpacks_next_to_itself() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("bundle.json"), br#"{"name":"foo","version":"1.0.0"}"#).unwrap();
        let archive = dir.path().join("foo-1.0.0.tgz");
        write_archive(src, archive.clone(), CancellationToken::new())
            .await
            .unwrap();

        let cmd = ImportCmd::new(
            ImportArgs {
                archive,
                destination: None,
                target: None,
                verbose: false,
                ca_cert_paths: Vec::new(),
                skip_tls_verify: false,
            },
            Home::new(dir.path().join("home")),
        );
        let summary = cmd.run(&CancellationToken::new()).await.unwrap();

        assert!(summary.thin);
        assert_eq!(summary.destination, dir.path().join("foo-1.0.0"));
        assert!(summary.destination.join("bundle.json").is_file());
        assert_eq!(std::fs::read_dir(dir.path().join("home/logs")).unwrap().count(), 1);
    }
}
