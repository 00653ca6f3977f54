use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use console::style;
use stowage::bundle::JsonLoader;
use stowage::imagestore::{ConstructionMode, Constructor, TransportBinding, new_constructor};
use stowage::packager::Exporter;
use stowage::registry::progress::{IndicatifProgress, ProgressTracker};
use stowage::registry::{HttpTransportProvider, TransportProvider};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::Result;
use crate::home::{Home, resolve_bundle_file_path};
use crate::utils;

/// Packages a bundle, and unless --thin is given every image it references,
/// into a single gzipped tarball. Images are stored as an OCI image layout
/// under artifacts/layout/. The archive is named <name>-<version>.tgz in the
/// current directory unless --output-file says otherwise.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Bundle in local storage (name[:version]), or a file with --bundle-is-file
    pub bundle: String,
    /// Save the exported bundle to this path
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,
    /// Interpret the bundle argument as a file path
    #[arg(short = 'f', long)]
    pub bundle_is_file: bool,
    /// Export only the bundle manifest
    #[arg(short, long)]
    pub thin: bool,
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

pub type ConstructorProvider = Arc<dyn Fn(bool) -> Box<dyn Constructor> + Send + Sync>;

pub struct ExportCmd {
    pub args: ExportArgs,
    pub home: Home,
    pub concurrency: usize,
    pub progress: Option<Arc<IndicatifProgress>>,
    pub transport_provider: Arc<dyn TransportProvider>,
    pub constructor_provider: ConstructorProvider,
}

impl ExportCmd {
    pub fn new(args: ExportArgs, home: Home) -> Self {
        Self {
            args,
            home,
            concurrency: config::get_concurrency(),
            progress: None,
            transport_provider: Arc::new(HttpTransportProvider),
            constructor_provider: Arc::new(|thin| {
                new_constructor(ConstructionMode::Creating { thin })
            }),
        }
    }

    /// Store constructor that asks the transport provider for a transport
    /// with the command's TLS settings each time a store is built.
    fn constructor(&self) -> Box<dyn Constructor> {
        Box::new(TransportBinding::new(
            self.transport_provider.clone(),
            self.args.ca_cert_paths.clone(),
            self.args.skip_tls_verify,
            (self.constructor_provider)(self.args.thin),
        ))
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let source =
            resolve_bundle_file_path(&self.args.bundle, &self.home, self.args.bundle_is_file)?;

        let mut exporter = Exporter::new(
            source,
            self.args.output_file.clone(),
            &self.home.logs(),
            Box::new(JsonLoader),
            self.constructor(),
        )?
        .with_concurrency(self.concurrency);
        if let Some(progress) = &self.progress {
            exporter = exporter.with_progress(progress.clone() as Arc<dyn ProgressTracker>);
        }

        let result = exporter.export(cancel).await;
        if self.args.verbose {
            println!("Export logs: {}", exporter.logs().display());
        }
        Ok(result?)
    }
}

pub async fn execute(args: ExportArgs, cancel: &CancellationToken) -> Result<()> {
    if args.skip_tls_verify {
        utils::print_warning("TLS certificate verification is disabled");
    }
    let progress = Arc::new(IndicatifProgress::new());
    let pb = progress.multi().add(utils::spinner(&format!("Exporting {}...", args.bundle)));

    let mut cmd = ExportCmd::new(args, Home::new(config::get_stowage_home()));
    cmd.progress = Some(progress);
    let result = cmd.run(cancel).await;
    pb.finish_and_clear();

    let archive = result?;
    let size = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
    utils::print_success(&format!(
        "Exported {} ({})",
        style(archive.display()).cyan(),
        utils::format_size(size)
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use stowage::imagestore::{Parameters, Store, StoreError, StoreKind};
    use stowage::packager::PackagerError;
    use stowage::registry::{Transport, TransportError};

    use super::*;
    use crate::error::StowageCliError;

    struct AddsEverything;

    #[async_trait]
    impl Store for AddsEverything {
        fn kind(&self) -> StoreKind {
            StoreKind::Registry
        }

        async fn add(&self, _image: &str) -> std::result::Result<String, StoreError> {
            Ok("added".to_string())
        }

        async fn push(
            &self,
            digest: &str,
            _src: &str,
            dst: &str,
        ) -> std::result::Result<String, StoreError> {
            Ok(format!("{dst}@{digest}"))
        }
    }

    /// Hands out one fixed transport, or fails, and records its arguments.
    struct FixedTransport {
        transport: Transport,
        fail: bool,
        calls: Mutex<Vec<(Vec<PathBuf>, bool)>>,
    }

    impl TransportProvider for FixedTransport {
        fn new_transport(
            &self,
            ca_cert_paths: &[PathBuf],
            skip_tls_verify: bool,
        ) -> std::result::Result<Transport, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((ca_cert_paths.to_vec(), skip_tls_verify));
            if self.fail {
                return Err(TransportError::ReadCertificate {
                    path: PathBuf::from("i-like-turtles.pem"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(self.transport.clone())
        }
    }

    struct ExpectTransport {
        expected: Transport,
        called: Arc<AtomicBool>,
    }

    impl Constructor for ExpectTransport {
        fn construct(&self, params: Parameters) -> std::result::Result<Box<dyn Store>, StoreError> {
            self.called.store(true, Ordering::SeqCst);
            assert!(params.transport.as_ref().unwrap().same(&self.expected));
            Ok(Box::new(AddsEverything))
        }
    }

    fn write_foo(dir: &Path) -> PathBuf {
        let path = dir.join("foo.json");
        std::fs::write(
            &path,
            br#"{"name":"foo","version":"1.0.0",
                "invocationImages":[{"imageType":"docker","image":"example.com/foo-installer:1.0.0"}]}"#,
        )
        .unwrap();
        path
    }

    async fn run_with(ca_cert_paths: Vec<PathBuf>, skip_tls_verify: bool, fail: bool) {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_foo(dir.path());
        let dest = dir.path().join("test.tgz");

        let provider = Arc::new(FixedTransport {
            transport: Transport::new(&[], false).unwrap(),
            fail,
            calls: Mutex::new(Vec::new()),
        });
        let called = Arc::new(AtomicBool::new(false));
        let expected = provider.transport.clone();
        let constructor_called = called.clone();

        let cmd = ExportCmd {
            args: ExportArgs {
                bundle: bundle.to_string_lossy().into_owned(),
                output_file: Some(dest.clone()),
                bundle_is_file: true,
                thin: false,
                verbose: false,
                ca_cert_paths: ca_cert_paths.clone(),
                skip_tls_verify,
            },
            home: Home::new(dir.path()),
            concurrency: 2,
            progress: None,
            transport_provider: provider.clone(),
            constructor_provider: Arc::new(move |_thin| {
                Box::new(ExpectTransport {
                    expected: expected.clone(),
                    called: constructor_called.clone(),
                }) as Box<dyn Constructor>
            }),
        };

        let result = cmd.run(&CancellationToken::new()).await;
        if fail {
            assert!(matches!(
                result,
                Err(StowageCliError::Packager(PackagerError::Store(StoreError::Configuration(_))))
            ));
            assert!(!dest.exists());
        } else {
            assert_eq!(result.unwrap(), dest);
        }

        assert_eq!(
            *provider.calls.lock().unwrap(),
            vec![(ca_cert_paths, skip_tls_verify)]
        );
        assert_eq!(called.load(Ordering::SeqCst), !fail);
    }

    #[tokio::test]
    async fn defaults_reach_the_transport_provider() {
        run_with(Vec::new(), false, false).await;
    }

    #[tokio::test]
    async fn one_certificate_reaches_the_transport_provider() {
        run_with(vec![PathBuf::from("a")], false, false).await;
    }

    #[tokio::test]
    async fn three_certificates_reach_the_transport_provider_unchanged() {
        run_with(
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")],
            false,
            false,
        )
        .await;
    }

    #[tokio::test]
    async fn skip_tls_verify_reaches_the_transport_provider() {
        run_with(Vec::new(), true, false).await;
    }

    #[tokio::test]
    async fn transport_failure_stops_before_construction() {
        run_with(Vec::new(), false, true).await;
    }

    #[tokio::test]
    async fn bundle_missing_from_local_storage_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::new(dir.path());
        std::fs::create_dir_all(home.bundles()).unwrap();
        let dest = dir.path().join("bar.tgz");

        let mut cmd = ExportCmd::new(
            ExportArgs {
                bundle: "bar:1.0.0".to_string(),
                output_file: Some(dest.clone()),
                bundle_is_file: false,
                thin: true,
                verbose: false,
                ca_cert_paths: Vec::new(),
                skip_tls_verify: false,
            },
            home,
        );
        cmd.concurrency = 1;

        assert!(matches!(
            cmd.run(&CancellationToken::new()).await,
            Err(StowageCliError::NotFound(_))
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn thin_export_of_stored_foo_holds_only_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::new(dir.path());
        std::fs::create_dir_all(home.bundles()).unwrap();
        std::fs::write(
            home.bundles().join("foo-1.0.0.json"),
            br#"{"name":"foo","version":"1.0.0"}"#,
        )
        .unwrap();
        std::fs::write(home.repositories(), br#"{"foo": {"1.0.0": "foo-1.0.0.json"}}"#).unwrap();
        let dest = dir.path().join("foo-1.0.0.tgz");

        let cmd = ExportCmd::new(
            ExportArgs {
                bundle: "foo:1.0.0".to_string(),
                output_file: Some(dest.clone()),
                bundle_is_file: false,
                thin: true,
                verbose: true,
                ca_cert_paths: Vec::new(),
                skip_tls_verify: false,
            },
            home.clone(),
        );
        cmd.run(&CancellationToken::new()).await.unwrap();

        let unpacked = dir.path().join("unpacked");
        std::fs::create_dir(&unpacked).unwrap();
        stowage::packager::unpack_archive(dest, unpacked.clone(), CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(&unpacked)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["bundle.json".to_string()]);
        assert_eq!(std::fs::read_dir(home.logs()).unwrap().count(), 1);
    }
}
