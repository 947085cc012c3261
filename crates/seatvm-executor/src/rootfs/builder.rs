use super::{BuildStage, ImageBuildConfig, ImageBuildError, InitSource, COMMAND_FILE, INIT_PATH, INIT_SCRIPT};
use crate::command;
use anyhow::{anyhow, bail, Context};
use bollard::container::{Config, RemoveContainerOptions, WaitContainerOptions};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, ImageInspect};
use bollard::Docker;
use futures::StreamExt;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

const MKFS_CANDIDATES: &[&str] = &["/sbin/mkfs.ext4", "/usr/sbin/mkfs.ext4", "/usr/local/sbin/mkfs.ext4"];

/// Places an image keeps `ip`; the guest entrypoint needs one of them.
const IP_TOOL_PATHS: &[&str] = &["sbin/ip", "bin/ip", "usr/sbin/ip", "usr/bin/ip"];

const INSTALL_IP_SCRIPT: &str = "\
if command -v apk >/dev/null 2>&1; then apk add --no-cache iproute2; \
elif command -v apt-get >/dev/null 2>&1; then apt-get update && apt-get install -y --no-install-recommends iproute2; \
elif command -v dnf >/dev/null 2>&1; then dnf install -y iproute; \
elif command -v yum >/dev/null 2>&1; then yum install -y iproute; \
else echo 'no known package manager' >&2; exit 1; fi";

/// Host programs the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct HostTools {
    pub mkfs: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub tar: PathBuf,
}

impl HostTools {
    pub fn locate() -> Result<Self, ImageBuildError> {
        let find = |name: &str, candidates: &[&str]| {
            command::find_program(name, candidates)
                .ok_or_else(|| ImageBuildError::MissingTool(name.to_string()))
        };
        Ok(Self {
            mkfs: find("mkfs.ext4", MKFS_CANDIDATES)?,
            mount: find("mount", &["/bin/mount", "/usr/bin/mount"])?,
            umount: find("umount", &["/bin/umount", "/usr/bin/umount"])?,
            tar: find("tar", &["/bin/tar", "/usr/bin/tar"])?,
        })
    }
}

/// Builds the read-only template image every seat's private copy starts from.
pub struct ImageBuilder {
    docker: Arc<Docker>,
}

impl ImageBuilder {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn connect() -> Result<Self, ImageBuildError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ImageBuildError::MissingTool(format!("docker daemon ({e})")))?;
        Ok(Self::new(Arc::new(docker)))
    }

    /// Run the whole pipeline. Nothing appears at `config.output` unless every stage succeeded.
    #[instrument(skip(self, config), fields(image = %config.image, output = %config.output.display()))]
    pub async fn build(&self, config: &ImageBuildConfig) -> Result<PathBuf, ImageBuildError> {
        config.validate()?;

        let tools = self.check_tooling().await?;
        let image = self.ensure_image(config).await?;

        let scratch = scratch_dir(config).map_err(|e| ImageBuildError::stage(BuildStage::Allocate, e))?;
        let mut mount = ScratchMount::new(scratch, tools.umount.clone());
        let raw = mount.dir().join("rootfs.ext4");
        let mount_point = mount.mount_point().to_path_buf();

        allocate(&tools, &raw, config.size_bytes)
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::Allocate, e))?;

        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::Mount, e))?;
        command::run(&tools.mount, [OsStr::new("-o"), OsStr::new("loop"), raw.as_os_str(), mount_point.as_os_str()])
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::Mount, e))?;
        mount.set_mounted();
        info!(mount_point = %mount_point.display(), "Image mounted");

        let populated = self.populate(&tools, config, &image, &mount_point).await;
        let unmounted = mount.unmount().await;
        populated?;
        unmounted.map_err(|e| ImageBuildError::stage(BuildStage::Unmount, e))?;

        publish(&raw, &config.output)
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::Publish, e))?;

        info!("Root filesystem image ready");
        Ok(config.output.clone())
    }

    async fn check_tooling(&self) -> Result<HostTools, ImageBuildError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ImageBuildError::MissingTool(format!("docker daemon ({e})")))?;
        let tools = HostTools::locate()?;
        debug!(?tools, "Host tools located");
        Ok(tools)
    }

    async fn ensure_image(&self, config: &ImageBuildConfig) -> Result<ImageInspect, ImageBuildError> {
        let stage = |e: anyhow::Error| ImageBuildError::stage(BuildStage::SourceImage, e);

        match self.docker.inspect_image(&config.image).await {
            Ok(inspect) => return Ok(inspect),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(stage(anyhow!(e))),
        }

        let Some(context_dir) = &config.build_context else {
            return Err(stage(anyhow!(
                "image {} not found locally and no build context given",
                config.image
            )));
        };

        info!(context = %context_dir.display(), "Building source image");
        self.build_image(&config.image, context_dir).await.map_err(stage)?;
        self.docker
            .inspect_image(&config.image)
            .await
            .map_err(|e| stage(anyhow!(e)))
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> anyhow::Result<()> {
        let context_dir = context_dir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let mut archive = tar::Builder::new(Vec::new());
            archive
                .append_dir_all(".", &context_dir)
                .with_context(|| format!("Failed to archive {}", context_dir.display()))?;
            Ok(archive.into_inner()?)
        })
        .await??;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(item) = stream.next().await {
            let info = item.context("Docker build failed")?;
            if let Some(error) = info.error {
                bail!("Docker build failed: {error}");
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(build = %line);
                }
            }
        }
        Ok(())
    }

    /// Everything that happens while the image is mounted.
    async fn populate(
        &self,
        tools: &HostTools,
        config: &ImageBuildConfig,
        image: &ImageInspect,
        root: &Path,
    ) -> Result<(), ImageBuildError> {
        self.export_into(tools, &config.image, root)
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::Populate, e))?;

        let inject = async {
            inject_init(root, &config.init).await?;
            let (entrypoint, cmd) = image
                .config
                .as_ref()
                .map(|c| (c.entrypoint.clone().unwrap_or_default(), c.cmd.clone().unwrap_or_default()))
                .unwrap_or_default();
            write_command(root, &entrypoint, &cmd).await?;
            write_resolv_conf(root, &config.nameservers).await?;
            anyhow::Ok(())
        };
        inject
            .await
            .map_err(|e| ImageBuildError::stage(BuildStage::InjectInit, e))?;

        if find_ip_tool(root).is_none() {
            warn!("`ip` missing from image, trying to install it");
            if let Err(e) = self.install_ip_tool(&config.image, root).await {
                warn!(error = %e, "Could not install `ip`; guest falls back to ifconfig");
            }
            match find_ip_tool(root) {
                Some(path) => info!(path = %path.display(), "`ip` installed"),
                None => warn!("Image has no `ip`; networking depends on ifconfig/route"),
            }
        }
        Ok(())
    }

    /// Stream `docker export` of a throwaway container straight into `tar -x`.
    async fn export_into(&self, tools: &HostTools, image: &str, root: &Path) -> anyhow::Result<()> {
        let container = self
            .docker
            .create_container::<String, String>(
                None,
                Config {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create export container")?;

        let result = self.stream_export(tools, &container.id, root).await;
        self.remove_container(&container.id).await;
        result
    }

    async fn stream_export(&self, tools: &HostTools, container_id: &str, root: &Path) -> anyhow::Result<()> {
        let mut tar = tokio::process::Command::new(&tools.tar)
            .arg("-x")
            .arg("-f")
            .arg("-")
            .arg("--numeric-owner")
            .arg("-C")
            .arg(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn tar")?;

        let mut stdin = tar.stdin.take().context("tar stdin not captured")?;
        let mut export = self.docker.export_container(container_id);
        let mut written: u64 = 0;
        let mut stream_error = None;
        while let Some(chunk) = export.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    stream_error = Some(anyhow!(e).context("Container export failed"));
                    break;
                }
            };
            if let Err(e) = stdin.write_all(&chunk).await {
                // tar exited early; its stderr says why.
                stream_error = Some(anyhow!(e).context("tar stopped reading"));
                break;
            }
            written += chunk.len() as u64;
        }
        drop(stdin);

        let output = tar.wait_with_output().await.context("Failed to wait for tar")?;
        if !output.status.success() {
            bail!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if let Some(e) = stream_error {
            return Err(e);
        }
        info!(bytes = written, "Container filesystem extracted");
        Ok(())
    }

    /// Chroot into the mounted image from a throwaway container and install iproute2.
    async fn install_ip_tool(&self, image: &str, root: &Path) -> anyhow::Result<()> {
        let config = Config {
            image: Some(image.to_string()),
            entrypoint: Some(vec!["chroot".to_string()]),
            cmd: Some(vec![
                "/target".to_string(),
                "/bin/sh".to_string(),
                "-c".to_string(),
                INSTALL_IP_SCRIPT.to_string(),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/target", root.display())]),
                network_mode: Some("host".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .context("Failed to create installer container")?;

        let result = async {
            self.docker
                .start_container::<String>(&container.id, None)
                .await
                .context("Failed to start installer container")?;
            let mut wait = self
                .docker
                .wait_container(&container.id, None::<WaitContainerOptions<String>>);
            while let Some(status) = wait.next().await {
                let status = status.context("Installer container failed")?;
                if status.status_code != 0 {
                    bail!("installer exited with {}", status.status_code);
                }
            }
            anyhow::Ok(())
        }
        .await;

        self.remove_container(&container.id).await;
        result
    }

    async fn remove_container(&self, id: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(id, options).await {
            warn!(container = %id, error = %e, "Failed to remove throwaway container");
        }
    }
}

fn scratch_dir(config: &ImageBuildConfig) -> anyhow::Result<TempDir> {
    let base = match &config.scratch_dir {
        Some(dir) => dir.clone(),
        None => match config.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    };
    std::fs::create_dir_all(&base).with_context(|| format!("Failed to create {}", base.display()))?;
    tempfile::Builder::new()
        .prefix(".seatvm-build-")
        .tempdir_in(&base)
        .with_context(|| format!("Failed to create scratch directory in {}", base.display()))
}

/// Sparse file of `size` bytes, formatted ext4.
async fn allocate(tools: &HostTools, raw: &Path, size: u64) -> anyhow::Result<()> {
    let file = tokio::fs::File::create(raw)
        .await
        .with_context(|| format!("Failed to create {}", raw.display()))?;
    file.set_len(size).await.context("Failed to size image file")?;
    drop(file);

    command::run(&tools.mkfs, [OsStr::new("-F"), OsStr::new("-q"), raw.as_os_str()]).await?;
    info!(size, "Formatted ext4 image");
    Ok(())
}

/// Scratch directory with the image loop-mounted at `mnt/`.
///
/// Dropping it while still mounted, e.g. when the build future is cancelled,
/// detaches the mount lazily before the directory is removed. If even that
/// fails the directory is left on disk so nothing is deleted through the mount.
struct ScratchMount {
    scratch: Option<TempDir>,
    mount_point: PathBuf,
    umount: PathBuf,
    mounted: bool,
}

impl ScratchMount {
    fn new(scratch: TempDir, umount: PathBuf) -> Self {
        let mount_point = scratch.path().join("mnt");
        Self {
            scratch: Some(scratch),
            mount_point,
            umount,
            mounted: false,
        }
    }

    fn dir(&self) -> &Path {
        self.mount_point.parent().unwrap_or(&self.mount_point)
    }

    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn set_mounted(&mut self) {
        self.mounted = true;
    }

    async fn unmount(&mut self) -> anyhow::Result<()> {
        if !self.mounted {
            return Ok(());
        }
        if let Err(e) = command::run(&self.umount, [&self.mount_point]).await {
            warn!(error = %e, "Unmount failed, retrying lazily");
            command::run(&self.umount, [OsStr::new("-l"), self.mount_point.as_os_str()]).await?;
        }
        self.mounted = false;
        debug!(mount_point = %self.mount_point.display(), "Unmounted");
        Ok(())
    }
}

impl Drop for ScratchMount {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        warn!(mount_point = %self.mount_point.display(), "Build abandoned while mounted, detaching");
        let detached = std::process::Command::new(&self.umount)
            .arg("-l")
            .arg(&self.mount_point)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if !detached {
            if let Some(scratch) = self.scratch.take() {
                let kept = scratch.path().to_path_buf();
                std::mem::forget(scratch);
                error!(path = %kept.display(), "Failed to detach image mount, leaving scratch directory in place");
            }
        }
    }
}

/// Mount-relative path for an absolute in-guest path.
fn in_root(root: &Path, guest_path: &str) -> PathBuf {
    root.join(guest_path.trim_start_matches('/'))
}

pub(crate) async fn inject_init(root: &Path, init: &InitSource) -> anyhow::Result<()> {
    let target = in_root(root, INIT_PATH);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Replace rather than write through: the image may ship a symlink here.
    remove_existing(&target).await?;

    match init {
        InitSource::Script => tokio::fs::write(&target, INIT_SCRIPT).await?,
        InitSource::Binary { path } => {
            tokio::fs::copy(path, &target)
                .await
                .with_context(|| format!("Failed to copy init binary {}", path.display()))?;
        }
    }
    tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await?;
    debug!(path = %target.display(), "Init injected");
    Ok(())
}

/// One argument per line; `None` when the image declares no command.
pub(crate) fn render_command(entrypoint: &[String], cmd: &[String]) -> Option<String> {
    let args: Vec<&String> = entrypoint.iter().chain(cmd).collect();
    if args.is_empty() {
        return None;
    }
    let mut out = String::new();
    for arg in args {
        out.push_str(arg);
        out.push('\n');
    }
    Some(out)
}

pub(crate) async fn write_command(root: &Path, entrypoint: &[String], cmd: &[String]) -> anyhow::Result<()> {
    let Some(rendered) = render_command(entrypoint, cmd) else {
        debug!("Image declares no command; guest will start a shell");
        return Ok(());
    };
    let target = in_root(root, COMMAND_FILE);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, rendered).await?;
    Ok(())
}

pub(crate) async fn write_resolv_conf(root: &Path, nameservers: &[Ipv4Addr]) -> anyhow::Result<()> {
    if nameservers.is_empty() {
        return Ok(());
    }
    let target = in_root(root, "/etc/resolv.conf");
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Usually a symlink into /run, which would resolve on the host.
    remove_existing(&target).await?;
    let body: String = nameservers.iter().map(|ns| format!("nameserver {ns}\n")).collect();
    tokio::fs::write(&target, body).await?;
    Ok(())
}

pub(crate) fn find_ip_tool(root: &Path) -> Option<PathBuf> {
    IP_TOOL_PATHS
        .iter()
        .map(|p| root.join(p))
        .find(|p| std::fs::symlink_metadata(p).is_ok())
}

async fn remove_existing(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to replace {}", path.display())),
    }
}

/// Move `src` to `dest` so readers only ever see a complete file.
pub(crate) async fn publish(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!("Output is on another filesystem, copying");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to move image to {}", dest.display()))
        }
    }

    // Copy next to the destination first so the final step is still a rename.
    let file_name = dest
        .file_name()
        .ok_or_else(|| anyhow!("output {} has no file name", dest.display()))?;
    let staging = dest.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));
    let copied = async {
        tokio::fs::copy(src, &staging).await?;
        tokio::fs::rename(&staging, dest).await
    }
    .await;
    if let Err(e) = copied {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e).with_context(|| format!("Failed to copy image to {}", dest.display()));
    }
    if let Err(e) = tokio::fs::remove_file(src).await {
        warn!(path = %src.display(), error = %e, "Failed to remove scratch image");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_command_joins_entrypoint_and_cmd() {
        assert_eq!(
            render_command(&strings(&["/usr/bin/tini", "--"]), &strings(&["node", "server.js"])),
            Some("/usr/bin/tini\n--\nnode\nserver.js\n".to_string())
        );
        assert_eq!(
            render_command(&[], &strings(&["/bin/bash"])),
            Some("/bin/bash\n".to_string())
        );
        assert_eq!(render_command(&[], &[]), None);
    }

    #[tokio::test]
    async fn test_inject_script_init() {
        let root = tempfile::tempdir().unwrap();
        inject_init(root.path(), &InitSource::Script).await.unwrap();

        let init = root.path().join("sbin/seat-init");
        assert_eq!(std::fs::read_to_string(&init).unwrap(), INIT_SCRIPT);
        let mode = std::fs::metadata(&init).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_inject_binary_init_replaces_symlink() {
        let root = tempfile::tempdir().unwrap();
        let host_bin = root.path().join("guest-init");
        std::fs::write(&host_bin, b"\x7fELFbinary").unwrap();

        std::fs::create_dir_all(root.path().join("sbin")).unwrap();
        std::os::unix::fs::symlink("/bin/busybox", root.path().join("sbin/seat-init")).unwrap();

        inject_init(root.path(), &InitSource::Binary { path: host_bin })
            .await
            .unwrap();

        let init = root.path().join("sbin/seat-init");
        assert!(!std::fs::symlink_metadata(&init).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&init).unwrap(), b"\x7fELFbinary");
    }

    #[tokio::test]
    async fn test_write_command_and_resolv_conf() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::os::unix::fs::symlink(
            "/run/systemd/resolve/stub-resolv.conf",
            root.path().join("etc/resolv.conf"),
        )
        .unwrap();

        write_command(root.path(), &[], &strings(&["sleep", "infinity"]))
            .await
            .unwrap();
        write_resolv_conf(root.path(), &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(root.path().join("etc/seat-init/command")).unwrap(),
            "sleep\ninfinity\n"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join("etc/resolv.conf")).unwrap(),
            "nameserver 1.1.1.1\nnameserver 8.8.8.8\n"
        );
    }

    #[tokio::test]
    async fn test_no_command_and_no_dns_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        write_command(root.path(), &[], &[]).await.unwrap();
        write_resolv_conf(root.path(), &[]).await.unwrap();
        assert!(!root.path().join("etc").exists());
    }

    #[test]
    fn test_find_ip_tool() {
        let root = tempfile::tempdir().unwrap();
        assert!(find_ip_tool(root.path()).is_none());

        std::fs::create_dir_all(root.path().join("sbin")).unwrap();
        // Dangling from the host's point of view, still present in the image.
        std::os::unix::fs::symlink("/bin/busybox", root.path().join("sbin/ip")).unwrap();
        assert_eq!(find_ip_tool(root.path()), Some(root.path().join("sbin/ip")));
    }

    #[tokio::test]
    async fn test_publish_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("scratch.ext4");
        std::fs::write(&src, b"image").unwrap();
        let dest = dir.path().join("images/template.ext4");

        publish(&src, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"image");
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("template.ext4");
        assert!(publish(&dir.path().join("missing.ext4"), &dest).await.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn test_scratch_dir_defaults_next_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImageBuildConfig::new("alpine", dir.path().join("out/template.ext4"));
        let scratch = scratch_dir(&config).unwrap();
        assert_eq!(scratch.path().parent(), Some(dir.path().join("out").as_path()));
    }

    fn host_program(name: &str) -> PathBuf {
        command::find_program(name, &[&format!("/bin/{name}"), &format!("/usr/bin/{name}")]).unwrap()
    }

    fn mounted_then_failed(scratch: TempDir, umount: PathBuf) -> Result<(), ImageBuildError> {
        let mut mount = ScratchMount::new(scratch, umount);
        std::fs::create_dir_all(mount.mount_point()).unwrap();
        mount.set_mounted();
        if mount.mount_point().exists() {
            return Err(ImageBuildError::stage(BuildStage::Populate, "export stream closed"));
        }
        Ok(())
    }

    #[test]
    fn test_scratch_mount_detaches_on_early_return() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = scratch.path().to_path_buf();

        let err = mounted_then_failed(scratch, host_program("true")).unwrap_err();
        assert_eq!(err.failed_stage(), BuildStage::Populate);
        assert!(!dir.exists());
    }

    #[test]
    fn test_scratch_mount_kept_when_detach_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = scratch.path().to_path_buf();

        assert!(mounted_then_failed(scratch, host_program("false")).is_err());
        assert!(dir.join("mnt").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_scratch_mount_disarmed_after_unmount() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = scratch.path().to_path_buf();
        let mut mount = ScratchMount::new(scratch, host_program("true"));
        mount.set_mounted();
        mount.unmount().await.unwrap();

        // Detaching again would fail; a disarmed guard never tries.
        mount.umount = host_program("false");
        drop(mount);
        assert!(!dir.exists());
    }

    #[tokio::test]
    #[ignore = "needs root, a Docker daemon and e2fsprogs"]
    async fn test_build_alpine_image() {
        crate::require_docker!();
        crate::require_root!();
        let dir = tempfile::tempdir().unwrap();
        let builder = ImageBuilder::connect().unwrap();

        let mut config = ImageBuildConfig::new("alpine:latest", dir.path().join("alpine.ext4"));
        config.size_bytes = 256 * 1024 * 1024;
        let output = builder.build(&config).await.unwrap();

        assert_eq!(std::fs::metadata(&output).unwrap().len(), config.size_bytes);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".seatvm-build-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    #[ignore = "needs a Docker daemon"]
    async fn test_missing_image_without_context_fails_in_source_stage() {
        crate::require_docker!();
        let dir = tempfile::tempdir().unwrap();
        let builder = ImageBuilder::connect().unwrap();
        let config = ImageBuildConfig::new(
            "seatvm/definitely-not-present:never",
            dir.path().join("out.ext4"),
        );
        let err = builder.build(&config).await.unwrap_err();
        if !matches!(err, ImageBuildError::MissingTool(_)) {
            assert_eq!(err.failed_stage(), BuildStage::SourceImage);
        }
        assert!(!dir.path().join("out.ext4").exists());
    }
}
