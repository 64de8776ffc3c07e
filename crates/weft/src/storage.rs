//! Local artifact storage.
//!
//! An artifact is a typed value persisted through its type's mapper:
//!
//! ```text
//! <root>/<namespace>/<name>/<version>/obj.json   {"type": …, "value": …}
//! <root>/<namespace>/<name>/latest               <version>
//! ```
//!
//! `version` is derived from the stored bytes, so saving the same typed value
//! twice yields the same reference.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, MapperError};
use crate::fs::Filesystem;
use crate::mapper::{MapperContext, build};
use crate::types::Type;
use crate::value::Value;

pub const ARTIFACT_SCHEME: &str = "local-artifact://";

const DEFAULT_NAMESPACE: &str = "default";

/// Explicit storage context threaded through execution: a filesystem root and
/// the namespace used when a caller names none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageContext {
    fs: Filesystem,
    namespace: Arc<str>,
}

impl StorageContext {
    pub fn new(fs: Filesystem, namespace: impl Into<Arc<str>>) -> Self {
        Self {
            fs,
            namespace: namespace.into(),
        }
    }

    /// Context rooted at `$WEFT_FILESYSTEM_DIR` in the default namespace.
    pub fn from_env() -> Option<Self> {
        Filesystem::from_env().map(|fs| Self::new(fs, DEFAULT_NAMESPACE))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn root(&self) -> &Filesystem {
        &self.fs
    }

    /// Filesystem for `namespace`, falling back to this context's namespace.
    pub fn filesystem(&self, namespace: Option<&str>) -> Result<Filesystem, Error> {
        Ok(self.fs.scoped(namespace.unwrap_or(self.namespace.as_ref()))?)
    }

    pub fn mapper_context(&self) -> MapperContext {
        MapperContext::new(self.namespace.clone())
    }
}

/// Parsed `local-artifact:///<name>[/<version>]` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactUri {
    pub name: String,
    pub version: Option<String>,
}

impl ArtifactUri {
    pub fn parse(uri: &str) -> Option<Self> {
        let path = uri.strip_prefix(ARTIFACT_SCHEME)?.strip_prefix('/')?;
        let mut parts = path.splitn(2, '/');
        let name = parts.next().filter(|n| !n.is_empty())?.to_string();
        let version = parts.next().filter(|v| !v.is_empty()).map(str::to_string);
        Some(Self { name, version })
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{ARTIFACT_SCHEME}/{}/{version}", self.name),
            None => write!(f, "{ARTIFACT_SCHEME}/{}", self.name),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredArtifact {
    #[serde(rename = "type")]
    ty: Type,
    value: serde_json::Value,
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::io(
            name,
            io::Error::new(io::ErrorKind::InvalidInput, "invalid artifact name"),
        ));
    }
    Ok(())
}

/// Persist `value` of type `ty` under `name`, returning a reference to the
/// saved version.
pub fn save(ctx: &StorageContext, name: &str, ty: &Type, value: &Value) -> Result<Value, Error> {
    check_name(name)?;
    let mapper = build(ty, &ctx.mapper_context(), &[Arc::from(name)])?;
    let stored = StoredArtifact {
        ty: ty.clone(),
        value: mapper.save(value)?,
    };
    let bytes = serde_json::to_vec_pretty(&stored)
        .map_err(|e| MapperError::new(mapper.address(), e.to_string()))?;
    let version = hex::encode(&Sha256::digest(&bytes)[..10]);

    let fs = ctx.filesystem(None)?;
    fs.write_atomic(format!("{name}/{version}/obj.json"), &bytes)?;
    fs.write_atomic(format!("{name}/latest"), version.as_bytes())?;
    log::debug!("saved artifact {name}/{version}");

    let uri = ArtifactUri {
        name: name.to_string(),
        version: Some(version),
    };
    Ok(Value::reference(uri.to_string()))
}

/// Load the artifact `uri` points to, along with its stored type. A reference
/// without a version resolves to the latest save.
pub fn get(ctx: &StorageContext, uri: &str) -> Result<(Type, Value), Error> {
    let parsed = ArtifactUri::parse(uri)
        .ok_or_else(|| MapperError::new(uri, "not a local artifact reference"))?;
    check_name(&parsed.name)?;
    let fs = ctx.filesystem(None)?;
    let version = match parsed.version {
        Some(version) => version,
        None => fs
            .read_to_string(format!("{}/latest", parsed.name))?
            .trim()
            .to_string(),
    };
    let text = fs.read_to_string(format!("{}/{version}/obj.json", parsed.name))?;
    let stored: StoredArtifact =
        serde_json::from_str(&text).map_err(|e| MapperError::new(uri, e.to_string()))?;
    let mapper = build(&stored.ty, &ctx.mapper_context(), &[Arc::from(parsed.name.as_str())])?;
    let value = mapper.load(&stored.value)?;
    Ok((stored.ty, value))
}
