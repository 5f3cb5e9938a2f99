//! `ResourceAddress`: a typed description of where response bytes come from.

use std::net::SocketAddr;

/// One upstream/local target a translate response can point a request at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// Nothing to fetch (e.g. a redirect/bounce response supplies the body).
    None,
    Local {
        path: String,
        content_type: Option<String>,
        delegate: Option<String>,
        document_root: Option<String>,
    },
    Http {
        scheme: Scheme,
        host: String,
        path: String,
        address_list: Vec<SocketAddr>,
    },
    Ajp {
        host: String,
        path: String,
        address_list: Vec<SocketAddr>,
    },
    Lhttp {
        program: String,
        args: Vec<String>,
        path: String,
        concurrency: u16,
    },
    Cgi {
        program: String,
        args: Vec<String>,
        path_info: Option<String>,
        document_root: Option<String>,
    },
    Fcgi {
        address_list: Vec<SocketAddr>,
        script_filename: String,
        path_info: Option<String>,
    },
    Was {
        program: String,
        args: Vec<String>,
        path_info: Option<String>,
        concurrency: u16,
    },
    Pipe {
        program: String,
        args: Vec<String>,
    },
    Nfs {
        server: String,
        export: String,
        path: String,
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl ResourceAddress {
    /// The path-like field the BASE / tail-appending machinery operates on,
    /// if this address variant has one.
    pub fn path(&self) -> Option<&str> {
        match self {
            ResourceAddress::None => None,
            ResourceAddress::Local { path, .. } => Some(path),
            ResourceAddress::Http { path, .. } => Some(path),
            ResourceAddress::Ajp { path, .. } => Some(path),
            ResourceAddress::Lhttp { path, .. } => Some(path),
            ResourceAddress::Cgi { path_info, .. } => path_info.as_deref(),
            ResourceAddress::Fcgi { path_info, .. } => path_info.as_deref(),
            ResourceAddress::Was { path_info, .. } => path_info.as_deref(),
            ResourceAddress::Pipe { .. } => None,
            ResourceAddress::Nfs { path, .. } => Some(path),
        }
    }

    /// Rebuilds this address with its path-like field's last path segment
    /// replaced by `tail`, per BASE semantics: a cached entry stores a
    /// prefix-stripped address, and each request appends its own tail back
    /// on.
    pub fn with_tail(&self, tail: &str) -> ResourceAddress {
        match self {
            ResourceAddress::Local {
                path,
                content_type,
                delegate,
                document_root,
            } => ResourceAddress::Local {
                path: format!("{path}{tail}"),
                content_type: content_type.clone(),
                delegate: delegate.clone(),
                document_root: document_root.clone(),
            },
            ResourceAddress::Http {
                scheme,
                host,
                path,
                address_list,
            } => ResourceAddress::Http {
                scheme: *scheme,
                host: host.clone(),
                path: format!("{path}{tail}"),
                address_list: address_list.clone(),
            },
            ResourceAddress::Ajp {
                host,
                path,
                address_list,
            } => ResourceAddress::Ajp {
                host: host.clone(),
                path: format!("{path}{tail}"),
                address_list: address_list.clone(),
            },
            ResourceAddress::Lhttp {
                program,
                args,
                path,
                concurrency,
            } => ResourceAddress::Lhttp {
                program: program.clone(),
                args: args.clone(),
                path: format!("{path}{tail}"),
                concurrency: *concurrency,
            },
            ResourceAddress::Fcgi {
                address_list,
                script_filename,
                path_info,
            } => ResourceAddress::Fcgi {
                address_list: address_list.clone(),
                script_filename: script_filename.clone(),
                path_info: Some(format!("{}{tail}", path_info.as_deref().unwrap_or(""))),
            },
            ResourceAddress::Was {
                program,
                args,
                path_info,
                concurrency,
            } => ResourceAddress::Was {
                program: program.clone(),
                args: args.clone(),
                path_info: Some(format!("{}{tail}", path_info.as_deref().unwrap_or(""))),
                concurrency: *concurrency,
            },
            ResourceAddress::Cgi {
                program,
                args,
                path_info,
                document_root,
            } => ResourceAddress::Cgi {
                program: program.clone(),
                args: args.clone(),
                path_info: Some(format!("{}{tail}", path_info.as_deref().unwrap_or(""))),
                document_root: document_root.clone(),
            },
            ResourceAddress::Nfs {
                server,
                export,
                path,
                content_type,
            } => ResourceAddress::Nfs {
                server: server.clone(),
                export: export.clone(),
                path: format!("{path}{tail}"),
                content_type: content_type.clone(),
            },
            ResourceAddress::None | ResourceAddress::Pipe { .. } => self.clone(),
        }
    }

    /// Inverse of `with_tail`: removes the last `tail_len` bytes from this
    /// address's path-like field, producing the base-only address BASE
    /// storage keeps so a later lookup's tail can be appended without
    /// doubling up whatever tail this address already carried.
    pub fn truncate_tail(&self, tail_len: usize) -> ResourceAddress {
        fn truncated(s: &str, tail_len: usize) -> String {
            let cut = s.len().saturating_sub(tail_len);
            // A byte-length mismatch between the request URI and the
            // backend path would land `cut` off a char boundary; that's
            // outside the common case this approximates, so fall back to
            // leaving the path untouched rather than panic.
            if s.is_char_boundary(cut) {
                s[..cut].to_string()
            } else {
                s.to_string()
            }
        }

        match self {
            ResourceAddress::Local {
                path,
                content_type,
                delegate,
                document_root,
            } => ResourceAddress::Local {
                path: truncated(path, tail_len),
                content_type: content_type.clone(),
                delegate: delegate.clone(),
                document_root: document_root.clone(),
            },
            ResourceAddress::Http {
                scheme,
                host,
                path,
                address_list,
            } => ResourceAddress::Http {
                scheme: *scheme,
                host: host.clone(),
                path: truncated(path, tail_len),
                address_list: address_list.clone(),
            },
            ResourceAddress::Ajp {
                host,
                path,
                address_list,
            } => ResourceAddress::Ajp {
                host: host.clone(),
                path: truncated(path, tail_len),
                address_list: address_list.clone(),
            },
            ResourceAddress::Lhttp {
                program,
                args,
                path,
                concurrency,
            } => ResourceAddress::Lhttp {
                program: program.clone(),
                args: args.clone(),
                path: truncated(path, tail_len),
                concurrency: *concurrency,
            },
            ResourceAddress::Fcgi {
                address_list,
                script_filename,
                path_info,
            } => ResourceAddress::Fcgi {
                address_list: address_list.clone(),
                script_filename: script_filename.clone(),
                path_info: path_info.as_deref().map(|p| truncated(p, tail_len)),
            },
            ResourceAddress::Was {
                program,
                args,
                path_info,
                concurrency,
            } => ResourceAddress::Was {
                program: program.clone(),
                args: args.clone(),
                path_info: path_info.as_deref().map(|p| truncated(p, tail_len)),
                concurrency: *concurrency,
            },
            ResourceAddress::Cgi {
                program,
                args,
                path_info,
                document_root,
            } => ResourceAddress::Cgi {
                program: program.clone(),
                args: args.clone(),
                path_info: path_info.as_deref().map(|p| truncated(p, tail_len)),
                document_root: document_root.clone(),
            },
            ResourceAddress::Nfs {
                server,
                export,
                path,
                content_type,
            } => ResourceAddress::Nfs {
                server: server.clone(),
                export: export.clone(),
                path: truncated(path, tail_len),
                content_type: content_type.clone(),
            },
            ResourceAddress::None | ResourceAddress::Pipe { .. } => self.clone(),
        }
    }

    /// `Http`/`Ajp` addresses must carry at least one socket address.
    pub fn is_valid(&self) -> bool {
        match self {
            ResourceAddress::Http { address_list, .. }
            | ResourceAddress::Ajp { address_list, .. } => !address_list.is_empty(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_addr(path: &str) -> ResourceAddress {
        ResourceAddress::Http {
            scheme: Scheme::Http,
            host: "origin".into(),
            path: path.into(),
            address_list: vec!["127.0.0.1:80".parse().unwrap()],
        }
    }

    #[test]
    fn with_tail_appends_to_path() {
        let base = http_addr("/a/b/");
        let full = base.with_tail("c.html");
        assert_eq!(full.path(), Some("/a/b/c.html"));
    }

    #[test]
    fn http_without_addresses_is_invalid() {
        let addr = ResourceAddress::Http {
            scheme: Scheme::Http,
            host: "o".into(),
            path: "/".into(),
            address_list: vec![],
        };
        assert!(!addr.is_valid());
    }
}
