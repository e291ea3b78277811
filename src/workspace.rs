//! Workspace bootstrap document
//!
//! Generated test workspaces need a couple of external rule repositories.
//! The document below declares them; tests compare it verbatim, so any
//! change here is a format change.

/// File name the bootstrap document is written to.
pub const DEFAULT_WORKSPACE_FILE: &str = "WORKSPACE";

/// An `http_archive` repository declaration.
struct HttpArchive {
    name: &'static str,
    sha256: &'static str,
    strip_prefix: &'static str,
    urls: &'static [&'static str],
}

const DEFAULT_REPOS: &[HttpArchive] = &[
    HttpArchive {
        name: "rules_cc",
        sha256: "812a3924348af40492017e7ca6f44819f572dae57bd4c736d2853b4f03522c45",
        strip_prefix: "rules_cc-2174aa631a0c32cb14ca0782af43aa0bd0aa1bb3",
        urls: &["https://github.com/wrowe/rules_cc/archive/2174aa631a0c32cb14ca0782af43aa0bd0aa1bb3.zip"],
    },
    HttpArchive {
        name: "rules_proto",
        sha256: "8e7d59a5b12b233be5652e3d29f42fba01c7cbab09f6b3a8d0a57ed6d1e9a0da",
        strip_prefix: "rules_proto-7e4afce6fe62dbff0a4a03450143146f9f2d7488",
        urls: &[
            "https://mirror.bazel.build/github.com/bazelbuild/rules_proto/archive/7e4afce6fe62dbff0a4a03450143146f9f2d7488.tar.gz",
            "https://github.com/bazelbuild/rules_proto/archive/7e4afce6fe62dbff0a4a03450143146f9f2d7488.tar.gz",
        ],
    },
];

/// Workspace document declaring the default external repositories.
///
/// Lines are joined with `\n` and there is no trailing newline.
pub fn workspace_with_default_repos() -> String {
    let mut lines = vec![
        "load('@bazel_tools//tools/build_defs/repo:http.bzl', 'http_archive')".to_string(),
    ];
    for repo in DEFAULT_REPOS {
        lines.push("http_archive(".into());
        lines.push(format!("    name = '{}',", repo.name));
        lines.push(format!("    sha256 = '{}',", repo.sha256));
        lines.push(format!("    strip_prefix = '{}',", repo.strip_prefix));
        lines.push("    urls = [".into());
        for url in repo.urls {
            lines.push(format!("        '{}',", url));
        }
        lines.push("    ],".into());
        lines.push(")".into());
    }
    lines.join("\n")
}
