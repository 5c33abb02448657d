/// Git metadata emitted by the build script.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: matches!(option_env!("VERGEN_GIT_DIRTY"), Some(s) if matches!(s.as_bytes(), b"true")),
};
