//! First-boot guest script: mounts, SSH key, timezone and machine-type marker.
//!
//! The script is assembled from fixed templates in a fixed order, since the guest
//! runs it top to bottom. It reaches the guest through its own virtio-fs share.

use cradle_fs::{self as fs, FsError};
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::mount::MountSpec;

/// Virtio-fs tag of the share holding the script.
pub const IGNITION_TAG: &str = "cradle-ignition";

/// Where the guest mounts the ignition share.
pub const IGNITION_GUEST_DIR: &str = "/mnt/.cradle-ignition";

pub const MACHINE_TYPE_FILE: &str = "/etc/cradle/machine-type";

const LOCALTIME: &str = "/etc/localtime";
const ZONEINFO_PREFIXES: [&str; 2] = ["/var/db/timezone/zoneinfo/", "/usr/share/zoneinfo/"];

const HEADER: &str = "#!/bin/sh\nset -eu\n";

const MOUNT_TEMPLATE: &str = "\
mkdir -p {{target}}
mount -t virtiofs -o {{mode}} {{tag}} {{target}}
echo {{fstab}} >> /etc/fstab
";

const SSH_KEY_TEMPLATE: &str = "\
install -d -m 700 {{ssh_dir}}
echo {{key}} >> {{authorized_keys}}
chmod 600 {{authorized_keys}}
chown -R {{user}} {{ssh_dir}}
";

const TIMEZONE_TEMPLATE: &str = "\
ln -sf {{zoneinfo}} /etc/localtime
echo {{zone}} > /etc/timezone
";

const MACHINE_TYPE_TEMPLATE: &str = "\
mkdir -p {{marker_dir}}
echo {{marker}} > {{marker_file}}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    Mount,
    SshKey,
    Timezone,
    MachineType,
}

impl Display for Fragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Mount => write!(f, "mount"),
            Fragment::SshKey => write!(f, "ssh key"),
            Fragment::Timezone => write!(f, "timezone"),
            Fragment::MachineType => write!(f, "machine type"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FragmentError {
    #[error("template has no value for placeholder '{0}'")]
    Placeholder(String),

    #[error("template has an unterminated placeholder")]
    Unterminated,

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("cannot derive a zone name from '{0}'")]
    UnknownZone(PathBuf),
}

#[derive(Error, Debug)]
pub enum IgnitionError {
    #[error("failed to build {fragment} fragment: {source}")]
    Fragment {
        fragment: Fragment,
        #[source]
        source: FragmentError,
    },

    #[error("failed to write ignition script: {0}")]
    Write(#[source] FsError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimezonePolicy {
    /// Use the host's zone, from the `/etc/localtime` symlink.
    Host,
    Zone(String),
    Skip,
}

#[derive(Debug, Clone)]
pub struct IgnitionRequest<'a> {
    pub mounts: &'a [MountSpec],
    /// Private key path; its `.pub` sibling is installed in the guest.
    pub ssh_identity: Option<&'a Path>,
    pub ssh_user: &'a str,
    pub timezone: TimezonePolicy,
    pub machine_type: &'a str,
}

/// Substitute `{{key}}` placeholders with shell-escaped values.
fn render(template: &str, values: &[(&str, &str)]) -> Result<String, FragmentError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(FragmentError::Unterminated)?;
        let key = after[..end].trim();
        let value = values
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
            .ok_or_else(|| FragmentError::Placeholder(key.to_string()))?;
        out.push_str(&shell_escape::unix::escape(Cow::Borrowed(value)));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn fragment_error(fragment: Fragment) -> impl FnOnce(FragmentError) -> IgnitionError {
    move |source| IgnitionError::Fragment { fragment, source }
}

fn lossy(path: &Path) -> Cow<'_, str> {
    path.to_string_lossy()
}

fn mount_fragment(mount: &MountSpec) -> Result<String, FragmentError> {
    let mode = if mount.read_only { "ro" } else { "rw" };
    let target = lossy(&mount.target);
    let fstab = format!("{} {} virtiofs defaults,{mode} 0 0", mount.tag, target);
    render(
        MOUNT_TEMPLATE,
        &[
            ("target", &*target),
            ("mode", mode),
            ("tag", mount.tag.as_str()),
            ("fstab", fstab.as_str()),
        ],
    )
}

async fn ssh_key_fragment(identity: &Path, user: &str) -> Result<String, FragmentError> {
    let mut public_key_path = identity.as_os_str().to_owned();
    public_key_path.push(".pub");
    let key = fs::read_file_to_string(PathBuf::from(public_key_path)).await?;

    let ssh_dir = if user == "root" {
        "/root/.ssh".to_string()
    } else {
        format!("/home/{user}/.ssh")
    };
    let authorized_keys = format!("{ssh_dir}/authorized_keys");
    render(
        SSH_KEY_TEMPLATE,
        &[
            ("ssh_dir", ssh_dir.as_str()),
            ("key", key.trim()),
            ("authorized_keys", authorized_keys.as_str()),
            ("user", user),
        ],
    )
}

/// Zone name from the target of a `localtime` symlink.
pub fn zone_from_localtime_target(target: &Path) -> Option<String> {
    let target = target.to_str()?;
    ZONEINFO_PREFIXES
        .iter()
        .find_map(|prefix| target.strip_prefix(prefix))
        .filter(|zone| !zone.is_empty())
        .map(str::to_string)
}

async fn host_zone() -> Result<String, FragmentError> {
    let target = fs::read_link(LOCALTIME).await?;
    zone_from_localtime_target(&target).ok_or(FragmentError::UnknownZone(target))
}

async fn timezone_fragment(policy: &TimezonePolicy) -> Result<Option<String>, FragmentError> {
    let zone = match policy {
        TimezonePolicy::Skip => return Ok(None),
        TimezonePolicy::Zone(zone) => zone.clone(),
        TimezonePolicy::Host => host_zone().await?,
    };
    let zoneinfo = format!("/usr/share/zoneinfo/{zone}");
    render(TIMEZONE_TEMPLATE, &[("zoneinfo", zoneinfo.as_str()), ("zone", zone.as_str())]).map(Some)
}

fn machine_type_fragment(marker: &str) -> Result<String, FragmentError> {
    let marker_file = Path::new(MACHINE_TYPE_FILE);
    let marker_dir = marker_file.parent().map(lossy).unwrap_or_default();
    render(
        MACHINE_TYPE_TEMPLATE,
        &[
            ("marker_dir", &*marker_dir),
            ("marker", marker),
            ("marker_file", MACHINE_TYPE_FILE),
        ],
    )
}

/// Build the script. Mounts overlapping the ignition share itself are left out.
#[instrument(skip_all, fields(mounts = request.mounts.len()))]
pub async fn generate(request: &IgnitionRequest<'_>) -> Result<Vec<u8>, IgnitionError> {
    let mut script = String::from(HEADER);

    let ignition_dir = Path::new(IGNITION_GUEST_DIR);
    for mount in request.mounts {
        if mount.overlaps(ignition_dir) {
            debug!(guest_path = %mount.target.display(), "Skipping mount that overlaps the ignition share");
            continue;
        }
        script.push_str(&mount_fragment(mount).map_err(fragment_error(Fragment::Mount))?);
    }

    if let Some(identity) = request.ssh_identity {
        let fragment = ssh_key_fragment(identity, request.ssh_user)
            .await
            .map_err(fragment_error(Fragment::SshKey))?;
        script.push_str(&fragment);
    }

    if let Some(fragment) = timezone_fragment(&request.timezone)
        .await
        .map_err(fragment_error(Fragment::Timezone))?
    {
        script.push_str(&fragment);
    }

    script.push_str(
        &machine_type_fragment(request.machine_type)
            .map_err(fragment_error(Fragment::MachineType))?,
    );

    Ok(script.into_bytes())
}

/// Replace any previous script at `path` with `payload`.
pub async fn write(path: &Path, payload: &[u8]) -> Result<(), IgnitionError> {
    fs::remove_file_if_exists(path)
        .await
        .map_err(IgnitionError::Write)?;
    if let Some(parent) = path.parent() {
        fs::create_dir(parent).await.map_err(IgnitionError::Write)?;
    }
    fs::write_file(path, payload)
        .await
        .map_err(IgnitionError::Write)?;
    debug!(path = %path.display(), bytes = payload.len(), "Wrote ignition script");
    Ok(())
}
