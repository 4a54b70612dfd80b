//! User-visible error presentation.
//!
//! A failure surfaces as a short title, a one-line message, and a
//! remediation hint drawn from the error taxonomy. Technical detail
//! (the full error chain) only appears when `NIMBUSFS_DEBUG` is set.

use nimbus_core::ports::remote::{RemoteError, RemoteErrorKind};

/// Presentation for one error class.
struct Presentation {
    title: &'static str,
    hint: &'static str,
}

fn presentation_for(err: &anyhow::Error) -> Presentation {
    // The interesting error may sit anywhere under the context layers.
    let remote = err
        .downcast_ref::<RemoteError>()
        .or_else(|| err.chain().find_map(|c| c.downcast_ref::<RemoteError>()));
    if let Some(remote) = remote {
        return match remote.kind() {
            RemoteErrorKind::Auth => Presentation {
                title: "authentication failed",
                hint: "re-run the sign-in helper to refresh auth_tokens.json",
            },
            RemoteErrorKind::Network | RemoteErrorKind::Timeout => Presentation {
                title: "cannot reach OneDrive",
                hint: "check your network connection; cached data stays available offline",
            },
            RemoteErrorKind::RateLimit => Presentation {
                title: "server asked us to slow down",
                hint: "wait a minute and try again",
            },
            RemoteErrorKind::Validation => Presentation {
                title: "request rejected by OneDrive",
                hint: "check the name for forbidden characters and your remaining quota",
            },
            _ => Presentation {
                title: "OneDrive request failed",
                hint: "try again; if it persists, run with --debug and file a report",
            },
        };
    }
    if err
        .chain()
        .any(|c| c.downcast_ref::<std::io::Error>().is_some())
    {
        return Presentation {
            title: "filesystem error",
            hint: "check permissions on the cache directory and the mountpoint",
        };
    }
    Presentation {
        title: "startup failed",
        hint: "run with --debug for details",
    }
}

/// Prints an error as title, message, and hint.
pub fn present_error(err: &anyhow::Error) {
    let p = presentation_for(err);
    eprintln!("error: {}", p.title);
    eprintln!("  {}", err);
    eprintln!("  hint: {}", p.hint);

    if std::env::var_os("NIMBUSFS_DEBUG").is_some() {
        for (depth, cause) in err.chain().skip(1).enumerate() {
            eprintln!("  cause[{depth}]: {cause}");
        }
    }
}
