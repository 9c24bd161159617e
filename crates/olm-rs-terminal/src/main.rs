use std::sync::Arc;

use olm_rs::api::InstallPlan;
use olm_rs::catalog::{CatalogKey, DirectoryCatalogProvider, ResolutionScope};
use olm_rs::cluster::{get_as, replace_as, KubeCluster, ObjectKey};
use olm_rs::controller::Controller;
use olm_rs::install_plan::InstallScope;
use olm_rs::resolver::ResolverBuilder;
use olm_rs::OlmRsOptions;

const USAGE: &str = "Usage: olm-rs [options] <command>

Commands:
    run                                          Run the controller against the current cluster
    resolve <namespace> <package> <channel> <catalog-namespace/catalog-name>
                                                 Print the steps a fresh subscription would plan
    approve <namespace> <install-plan>           Approve a manual install plan
    crds                                         Print the controller's CRDs";

#[tokio::main]
async fn main() {
	let mut opts;

	/* Parse console input */
	let parsed_options = {
		let args: Vec<String> = std::env::args().collect();

		opts = getopts::Options::new();
		opts.optflag( "h", "help",        "Show help");
		opts.optflag( "v", "verbose",     "Increased vebosity");
		opts.optopt(  "n", "namespace",   "Only watch this namespace", "NAMESPACE");
		opts.optopt(  "c", "catalog-dir", "Directory catalogs are read from", "DIR");
		opts.optopt(  "w", "workers",     "Number of reconcile workers", "COUNT");
		opts.parsing_style(getopts::ParsingStyle::FloatingFrees);

		let parsed_options = match opts.parse(&args[1..]) {
			Ok(m)  => { m }
			Err(e) => { println!("Unable to parse options: {}", e); return }
		};

		if parsed_options.opt_present("h") {
			eprintln!("{}", opts.usage(USAGE));
			return;
		}

		parsed_options
	};

	{
		let mut builder = env_logger::Builder::from_default_env();
		if parsed_options.opt_present("v") {
			builder.filter_level(log::LevelFilter::Debug);
		}
		builder.init();
	}

	let mut options = OlmRsOptions::default();
	if let Some(ns) = parsed_options.opt_str("n") {
		options.set_namespace(Some(ns));
	}
	if let Some(dir) = parsed_options.opt_str("c") {
		if !options.set_catalog_dir(dir.clone().into()) {
			log::warn!("Ignoring catalog directory {}", dir);
		}
	}
	if let Some(workers) = parsed_options.opt_str("w") {
		match workers.parse::<usize>() {
			Ok(w) if options.set_workers(w) => {},
			_ => log::warn!("Ignoring worker count {}", workers),
		}
	}

	let result = match parsed_options.free.first().map(String::as_str) {
		Some("run") => run(options).await,
		Some("resolve") => resolve(&options, &parsed_options.free[1..]).await,
		Some("approve") => approve(&parsed_options.free[1..]).await,
		Some("crds") => print_crds(),
		Some(other) => Err(Error::UnknownCommand(other.to_string())),
		None => { eprintln!("{}", opts.usage(USAGE)); return },
	};

	if let Err(e) = result {
		log::error!("{}", e);
		std::process::exit(1);
	}
}

async fn run(options: OlmRsOptions) -> Result<(), Error> {
	let client = kube::Client::try_default().await?;
	let cluster = Arc::new(KubeCluster::new(client.clone()));
	let catalogs = Arc::new(DirectoryCatalogProvider::new(options.catalog_dir()));
	log::info!("Reading catalogs from {}", options.catalog_dir().display());

	let controller = Arc::new(Controller::new(cluster, catalogs, options));
	olm_rs::controller::runtime::run(controller, client).await;
	Ok(())
}

async fn resolve(options: &OlmRsOptions, args: &[String]) -> Result<(), Error> {
	let [namespace, package, channel, catalog] = args else { return Err(Error::MissingArgument) };
	let catalog = match catalog.split_once('/') {
		Some((ns, name)) => CatalogKey::new(name, ns),
		None => return Err(Error::MissingArgument),
	};

	let provider = DirectoryCatalogProvider::new(options.catalog_dir());
	let scope = ResolutionScope::build(&provider, namespace, options.global_catalog_namespace(), vec![]).await?;
	for unhealthy in &scope.unhealthy {
		log::warn!("Catalog {} is unhealthy and was left out", unhealthy);
	}

	let resolution = ResolverBuilder::new(&scope)
		.package(package.as_str(), channel.as_str())
		.catalog(catalog)
		.resolve()
		.map_err(olm_rs::Error::from)?;

	println!("Channel head: {}", resolution.head().name);
	if resolution.bundles.is_empty() {
		println!("Nothing to install.");
		return Ok(())
	}
	println!("Bundles: {}", resolution.bundle_names().join(", "));
	for step in olm_rs::install_plan::plan(&resolution.bundles, namespace, InstallScope::OwnNamespace)? {
		println!("\t{} {} {}/{} ({})", step.resolving, step.resource_kind, step.resource_namespace.as_deref().unwrap_or("-"), step.resource_name, step.resource_version);
	}
	Ok(())
}

async fn approve(args: &[String]) -> Result<(), Error> {
	let [namespace, name] = args else { return Err(Error::MissingArgument) };
	let cluster = KubeCluster::new(kube::Client::try_default().await?);

	let key = ObjectKey::of::<InstallPlan>(Some(namespace.as_str()), name.as_str());
	let mut plan = get_as::<InstallPlan>(&cluster, &key).await?.ok_or_else(|| olm_rs::Error::NotFound(key.to_string()))?;
	if plan.spec.approved {
		println!("{} is already approved.", key);
		return Ok(())
	}
	plan.spec.approved = true;
	replace_as(&cluster, &plan).await?;
	println!("Approved {}.", key);
	Ok(())
}

fn print_crds() -> Result<(), Error> {
	for crd in olm_rs::api::crds() {
		println!("{}", serde_json::to_string_pretty(&crd).map_err(olm_rs::Error::from)?);
	}
	Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("olm-rs error: {0}")]
	OlmRs(#[from] olm_rs::Error),
	#[error("Kubernetes client error: {0}")]
	Kube(#[from] kube::Error),
	#[error("Missing argument")]
	MissingArgument,
	#[error("Unknown command {0}")]
	UnknownCommand(String),
}
