//! Local/remote `kube::Config` resolution.
//!
//! Outside `--devmode` the local cluster is always the in-cluster
//! environment (`Config::from_cluster_env`) and the remote cluster is loaded
//! from an explicit kubeconfig file (`--kubeconfig` / `KUBECONFIG_PATH`). In
//! `--devmode` both sides are loaded from the default kubeconfig file using
//! named contexts, so the controller can be run and tested from a laptop
//! against two contexts in the same file (by convention `prototype-general`
//! for local and `prototype-secure` for remote).

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("building kube config: {0}")]
    Kube(#[from] kube::Error),

    #[error("reading kubeconfig file {path:?}: {source}")]
    ReadKubeconfig {
        path: String,
        #[source]
        source: kube::config::KubeconfigError,
    },

    #[error("building client: {0}")]
    Client(#[source] kube::Error),

    #[error(
        "local and remote clusters resolve to the same API server ({host}); \
         refusing to start outside --devmode"
    )]
    LocalRemoteConfigMatch { host: String },
}

/// The local cluster's config. In production this is always the in-cluster
/// service account; in devmode it is the named `local_context` from the
/// default kubeconfig file, so a single binary running on a laptop can
/// stand in for the in-cluster identity.
pub async fn local_config(devmode: bool, local_context: &str) -> Result<Config, ConfigError> {
    if devmode {
        named_context_config(None, Some(local_context)).await
    } else {
        Ok(Config::from_cluster_env()?)
    }
}

/// The remote cluster's config. Outside devmode this always comes from an
/// explicit kubeconfig file (`kubeconfig_path`, falling back to the default
/// kubeconfig location if unset), using whatever current-context that file
/// declares — `--remote-context` only applies in devmode, where both sides
/// are split out of the same file by named context instead of by file. In
/// devmode it is the named `remote_context` from the default kubeconfig
/// file.
pub async fn remote_config(
    devmode: bool,
    kubeconfig_path: Option<&str>,
    remote_context: &str,
) -> Result<Config, ConfigError> {
    if devmode {
        named_context_config(None, Some(remote_context)).await
    } else {
        named_context_config(kubeconfig_path, None).await
    }
}

async fn named_context_config(path: Option<&str>, context: Option<&str>) -> Result<Config, ConfigError> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        cluster: None,
        user: None,
    };
    match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|source| ConfigError::ReadKubeconfig {
                path: path.to_string(),
                source,
            })?;
            Ok(Config::from_custom_kubeconfig(kubeconfig, &options).await?)
        }
        None => Ok(Config::from_kubeconfig(&options).await?),
    }
}

/// Enforce that the local and remote API servers genuinely differ, unless
/// devmode is set (where both are legitimately hosted on the same
/// developer-facing cluster split only by namespace/context convention).
pub fn validate_hosts_differ(local: &Config, remote: &Config, devmode: bool) -> Result<(), ConfigError> {
    if devmode {
        return Ok(());
    }
    if local.cluster_url == remote.cluster_url {
        return Err(ConfigError::LocalRemoteConfigMatch {
            host: local.cluster_url.to_string(),
        });
    }
    Ok(())
}

pub fn client_from_config(config: Config) -> Result<Client, ConfigError> {
    Client::try_from(config).map_err(ConfigError::Client)
}
