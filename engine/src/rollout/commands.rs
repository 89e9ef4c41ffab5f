//! Remote shell commands used by introspection and rollouts
//!
//! Every command targets a Linux host running docker compose. Instance paths
//! are validated at registration and quoted again here.

use uuid::Uuid;

use crate::models::Instance;
use crate::transport::shell_quote;

/// Prints `COMPOSE=plugin` or `COMPOSE=standalone`
const DETECT_COMPOSE: &str =
    "if docker compose version >/dev/null 2>&1; then echo COMPOSE=plugin; else echo COMPOSE=standalone; fi";

/// Directory an update is unpacked into before it replaces the instance
pub fn next_dir(path: &str) -> String {
    format!("{}.next", path.trim_end_matches('/'))
}

/// Directory the replaced release is kept in until the next update
pub fn prev_dir(path: &str) -> String {
    format!("{}.prev", path.trim_end_matches('/'))
}

/// Read an instance's release and stand files plus the compose flavour
pub fn introspect(path: &str) -> Vec<String> {
    let path = path.trim_end_matches('/');
    vec![
        format!(
            "cat {} {}",
            shell_quote(&format!("{path}/version.env")),
            shell_quote(&format!("{path}/stand.env"))
        ),
        DETECT_COMPOSE.to_string(),
    ]
}

/// Where a staged rollout puts the archive for one instance
pub fn staged_archive_path(staging_dir: &str, artifact: Uuid, instance: Uuid) -> String {
    format!(
        "{}/fleetops-{}-{}.tar.gz",
        staging_dir.trim_end_matches('/'),
        artifact,
        instance
    )
}

/// Unpack `archive` next to the instance and carry its stand file over;
/// prints the unpacked `version.env` last
pub fn prepare(instance: &Instance, archive: &str) -> Vec<String> {
    let path = shell_quote(instance.path.trim_end_matches('/'));
    let next = shell_quote(&next_dir(&instance.path));
    let archive = shell_quote(archive);
    vec![
        format!("rm -rf {next} && mkdir -p {next}"),
        format!("tar -xzf {archive} -C {next}"),
        format!("cp {path}/stand.env {next}/stand.env"),
        format!("rm -f {archive}"),
        format!("cat {next}/version.env"),
    ]
}

/// Index of the command in [`pull_images`] printing the expected image count
pub const EXPECTED_IMAGES_INDEX: usize = 1;

/// Index of the command in [`pull_images`] printing the pulled image count
pub const PULLED_IMAGES_INDEX: usize = 2;

/// Pull the unpacked release's images and print expected and present counts
pub fn pull_images(instance: &Instance) -> Vec<String> {
    let next = shell_quote(&next_dir(&instance.path));
    let compose = instance.compose.command();
    vec![
        format!("cd {next} && {compose} pull -q"),
        format!("cd {next} && {compose} config --images | sort -u | wc -l"),
        format!(
            "cd {next} && {compose} config --images | sort -u | xargs -r docker image inspect --format '{{{{.Id}}}}' 2>/dev/null | wc -l"
        ),
    ]
}

/// Free KiB on the filesystem holding `remote_path`
pub fn free_space(remote_path: &str) -> String {
    let dir = match remote_path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
    };
    format!("df -Pk {} | awk 'NR==2 {{print $4}}'", shell_quote(&dir))
}

/// Parse the output of [`free_space`]
pub fn parse_free_space(stdout: &str) -> Option<u64> {
    stdout.trim().lines().last()?.trim().parse().ok()
}

/// Copy the instance directory aside
pub fn backup(instance: &Instance, stamp: &str) -> Vec<String> {
    let path = instance.path.trim_end_matches('/');
    vec![format!(
        "cp -a {} {}",
        shell_quote(path),
        shell_quote(&format!("{path}.bak-{stamp}"))
    )]
}

/// Replace the instance with the release in `archive` and restart it.
/// The previous release is kept in the `.prev` directory.
pub fn update(instance: &Instance, archive: &str) -> Vec<String> {
    let path = shell_quote(instance.path.trim_end_matches('/'));
    let next = shell_quote(&next_dir(&instance.path));
    let prev = shell_quote(&prev_dir(&instance.path));
    let archive = shell_quote(archive);
    let compose = instance.compose.command();
    vec![
        // a stale .prev would be restored by a rollback of this update
        format!("rm -rf {prev} {next} && mkdir -p {next}"),
        format!("tar -xzf {archive} -C {next}"),
        format!("cp {path}/stand.env {next}/stand.env"),
        format!("cd {path} && {compose} down"),
        format!("mv {path} {prev} && mv {next} {path}"),
        format!("cd {path} && {compose} pull -q && {compose} up -d"),
    ]
}

/// Restore the `.prev` release if this update got as far as swapping, then
/// start whatever is in place
pub fn rollback(instance: &Instance) -> Vec<String> {
    let path = shell_quote(instance.path.trim_end_matches('/'));
    let prev = shell_quote(&prev_dir(&instance.path));
    let compose = instance.compose.command();
    vec![
        format!(
            "if [ -d {prev} ]; then (cd {path} && {compose} down || true) && rm -rf {path} && mv {prev} {path}; fi"
        ),
        format!("cd {path} && {compose} up -d"),
    ]
}
