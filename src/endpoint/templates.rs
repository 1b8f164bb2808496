use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::nginx_parser::{quote_param, single_quote_param, Directive};
use crate::types::{Endpoint, EndpointBase, EndpointType};

pub const LOCATION_DIRECTIVE: &str = "location";
pub const REWRITE_DIRECTIVE: &str = "rewrite";
pub const PROXY_PASS_DIRECTIVE: &str = "proxy_pass";
pub const SET_DIRECTIVE: &str = "set";
pub const PROXY_HTTP_VERSION_DIRECTIVE: &str = "proxy_http_version";
pub const PROXY_SET_HEADER_DIRECTIVE: &str = "proxy_set_header";
pub const PROXY_READ_TIMEOUT_DIRECTIVE: &str = "proxy_read_timeout";
pub const SUB_FILTER_DIRECTIVE: &str = "sub_filter";
pub const SUB_FILTER_ONCE_DIRECTIVE: &str = "sub_filter_once";
pub const SUB_FILTER_TYPES_DIRECTIVE: &str = "sub_filter_types";

/// Префикс имени upstream переменной endpoint
pub const UPSTREAM_VAR_PREFIX: &str = "$v";

/// Порт, который не выводится в proxy_pass
const DEFAULT_PORT: u16 = 80;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z]+)\}").expect("placeholder regex"));

/// Плейсхолдеры шаблонов
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Upstream переменная endpoint ($v<id>)
    Var,
    /// ":<port>" или пусто
    Port,
    /// Внешний путь в location/rewrite, внутренний в proxy_pass
    Path,
    /// Ссылка (ref) endpoint
    Ref,
    /// Отрендеренный location (в заголовках и sub_filter)
    Loc,
}

impl Placeholder {
    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::Var => "{var}",
            Placeholder::Port => "{port}",
            Placeholder::Path => "{path}",
            Placeholder::Ref => "{ref}",
            Placeholder::Loc => "{loc}",
        }
    }
}

/// Какие плейсхолдеры допустимы в каком слоте шаблона
const LOCATION_PLACEHOLDERS: &[Placeholder] = &[Placeholder::Ref, Placeholder::Path];
const PROXY_PASS_PLACEHOLDERS: &[Placeholder] = &[Placeholder::Var, Placeholder::Port, Placeholder::Path];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("{slot} template '{template}' uses unsupported placeholder '{placeholder}'")]
    UnsupportedPlaceholder {
        slot: &'static str,
        template: String,
        placeholder: String,
    },
    #[error("{0} template must not be empty")]
    Empty(&'static str),
}

/// Шаблоны одного типа endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSet {
    pub location: String,
    #[serde(default)]
    pub rewrite: Option<String>,
    pub proxy_pass: String,
}

/// Таблица шаблонов по типу endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Templates {
    pub standard: TemplateSet,
    pub alias: TemplateSet,
    pub default_gui: TemplateSet,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            standard: TemplateSet {
                location: "/endpoints/deployment/{ref}/{path}".to_string(),
                rewrite: Some("/endpoints/deployment/{ref}/{path}(.*) /$1 break".to_string()),
                proxy_pass: "http://{var}{port}{path}$1$is_args$args".to_string(),
            },
            alias: TemplateSet {
                location: "/endpoints/alias/{path}".to_string(),
                rewrite: Some("/endpoints/alias/{path}(.*) /$1 break".to_string()),
                proxy_pass: "http://{var}{port}{path}$1$is_args$args".to_string(),
            },
            default_gui: TemplateSet {
                location: "/".to_string(),
                rewrite: None,
                proxy_pass: "http://{var}{port}{path}".to_string(),
            },
        }
    }
}

fn check_slot(slot: &'static str, template: &str, allowed: &[Placeholder]) -> Result<(), TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty(slot));
    }
    for cap in PLACEHOLDER_RE.captures_iter(template) {
        let found = &cap[0];
        if !allowed.iter().any(|p| p.token() == found) {
            return Err(TemplateError::UnsupportedPlaceholder {
                slot,
                template: template.to_string(),
                placeholder: found.to_string(),
            });
        }
    }
    Ok(())
}

fn substitute(template: &str, values: &[(Placeholder, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (p, v)| acc.replace(p.token(), v))
}

/// Значение таймаута в формате nginx
pub fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_nanos() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis().max(1))
    }
}

pub fn upstream_var(id: &str) -> String {
    format!("{}{}", UPSTREAM_VAR_PREFIX, id)
}

impl Templates {
    /// Проверяет, что каждый шаблон использует только свои плейсхолдеры
    pub fn validate(&self) -> Result<(), TemplateError> {
        for set in [&self.standard, &self.alias, &self.default_gui] {
            check_slot("location", &set.location, LOCATION_PLACEHOLDERS)?;
            if let Some(rewrite) = &set.rewrite {
                check_slot("rewrite", rewrite, LOCATION_PLACEHOLDERS)?;
            }
            check_slot("proxy_pass", &set.proxy_pass, PROXY_PASS_PLACEHOLDERS)?;
        }
        Ok(())
    }

    pub fn for_type(&self, t: EndpointType) -> &TemplateSet {
        match t {
            EndpointType::Standard => &self.standard,
            EndpointType::Alias => &self.alias,
            EndpointType::DefaultGui => &self.default_gui,
        }
    }

    pub fn render_location(&self, t: EndpointType, reference: &str, ext_path: &str) -> String {
        substitute(
            &self.for_type(t).location,
            &[(Placeholder::Ref, reference), (Placeholder::Path, ext_path)],
        )
    }

    pub fn render_rewrite(&self, t: EndpointType, reference: &str, ext_path: &str) -> Option<String> {
        self.for_type(t).rewrite.as_ref().map(|tmpl| {
            substitute(tmpl, &[(Placeholder::Ref, reference), (Placeholder::Path, ext_path)])
        })
    }

    pub fn render_upstream_target(&self, endpoint: &Endpoint) -> String {
        let port = match endpoint.base.port {
            Some(p) if p != DEFAULT_PORT => format!(":{}", p),
            _ => String::new(),
        };
        let var = upstream_var(&endpoint.id);
        substitute(
            &self.for_type(endpoint.endpoint_type).proxy_pass,
            &[
                (Placeholder::Var, var.as_str()),
                (Placeholder::Port, port.as_str()),
                (Placeholder::Path, endpoint.base.int_path.as_str()),
            ],
        )
    }

    /// Собирает endpoint заданного типа и вычисляет location и ID
    pub fn new_endpoint(&self, t: EndpointType, parent_id: &str, base: EndpointBase) -> Endpoint {
        let location = self.render_location(t, &base.reference, &base.ext_path);
        Endpoint {
            id: Endpoint::derive_id(&location),
            parent_id: parent_id.to_string(),
            endpoint_type: t,
            location,
            base,
        }
    }

    /// Блок location endpoint; комментарий с метаданными висит на директиве set
    pub fn render_location_block(&self, endpoint: &Endpoint, comment: String) -> Directive {
        let mut directives = vec![Directive::new(
            SET_DIRECTIVE,
            vec![upstream_var(&endpoint.id), quote_param(&endpoint.base.host)],
        )
        .with_comment(comment)];
        if endpoint.endpoint_type != EndpointType::DefaultGui {
            if let Some(rewrite) =
                self.render_rewrite(endpoint.endpoint_type, &endpoint.base.reference, &endpoint.base.ext_path)
            {
                directives.push(Directive::new(
                    REWRITE_DIRECTIVE,
                    rewrite.split_whitespace().map(str::to_string).collect(),
                ));
            }
            directives.extend(render_header_directives(endpoint));
            directives.extend(render_substitution_directives(endpoint));
        }
        directives.push(Directive::new(
            PROXY_PASS_DIRECTIVE,
            vec![self.render_upstream_target(endpoint)],
        ));
        Directive::new(LOCATION_DIRECTIVE, vec![quote_param(&endpoint.location)]).with_block(directives)
    }
}

/// Пары заголовок/значение с подставленным {loc}, плюс заголовки WebSocket
pub fn render_headers(endpoint: &Endpoint) -> Vec<(String, String)> {
    let mut headers: std::collections::BTreeMap<String, String> = endpoint
        .base
        .proxy_conf
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, &[(Placeholder::Loc, endpoint.location.as_str())])))
        .collect();
    if endpoint.base.proxy_conf.websocket {
        headers.insert("Upgrade".to_string(), "$http_upgrade".to_string());
        headers.insert("Connection".to_string(), "$connection_upgrade".to_string());
    }
    headers.into_iter().collect()
}

pub fn render_header_directives(endpoint: &Endpoint) -> Vec<Directive> {
    let conf = &endpoint.base.proxy_conf;
    let mut directives = Vec::new();
    if conf.websocket {
        directives.push(Directive::new(PROXY_HTTP_VERSION_DIRECTIVE, vec!["1.1".to_string()]));
    }
    if !conf.read_timeout.is_zero() {
        directives.push(Directive::new(
            PROXY_READ_TIMEOUT_DIRECTIVE,
            vec![format_timeout(conf.read_timeout)],
        ));
    }
    for (key, value) in render_headers(endpoint) {
        directives.push(Directive::new(
            PROXY_SET_HEADER_DIRECTIVE,
            vec![quote_param(&key), quote_param(&value)],
        ));
    }
    directives
}

pub fn render_substitution_directives(endpoint: &Endpoint) -> Vec<Directive> {
    let sub = &endpoint.base.string_sub;
    if sub.filters.is_empty() {
        return Vec::new();
    }
    let mut directives: Vec<Directive> = sub
        .filters
        .iter()
        .map(|f| {
            Directive::new(
                SUB_FILTER_DIRECTIVE,
                vec![
                    single_quote_param(&f.pattern),
                    single_quote_param(&substitute(&f.replacement, &[(Placeholder::Loc, endpoint.location.as_str())])),
                ],
            )
        })
        .collect();
    let types = if sub.mime_types.is_empty() {
        vec!["*".to_string()]
    } else {
        sub.mime_types.clone()
    };
    directives.push(Directive::new(SUB_FILTER_TYPES_DIRECTIVE, types));
    directives.push(Directive::new(
        SUB_FILTER_ONCE_DIRECTIVE,
        vec![if sub.replace_once { "on" } else { "off" }.to_string()],
    ));
    directives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubFilter;

    fn base(reference: &str, ext_path: &str) -> EndpointBase {
        EndpointBase {
            reference: reference.to_string(),
            host: reference.to_string(),
            int_path: "/".to_string(),
            ext_path: ext_path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_templates_are_valid() {
        assert!(Templates::default().validate().is_ok());
    }

    #[test]
    fn test_unsupported_placeholder_rejected() {
        let mut t = Templates::default();
        t.alias.location = "/endpoints/alias/{var}".to_string();
        assert!(matches!(
            t.validate(),
            Err(TemplateError::UnsupportedPlaceholder { slot: "location", .. })
        ));

        let mut t = Templates::default();
        t.standard.proxy_pass = "http://{var}{ref}".to_string();
        assert!(t.validate().is_err());

        let mut t = Templates::default();
        t.default_gui.location = " ".to_string();
        assert_eq!(t.validate(), Err(TemplateError::Empty("location")));
    }

    #[test]
    fn test_regex_quantifier_is_not_a_placeholder() {
        let mut t = Templates::default();
        t.standard.rewrite = Some("/x/[0-9]{3}/{path}(.*) /$1 break".to_string());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_render_location_per_type() {
        let t = Templates::default();
        assert_eq!(
            t.render_location(EndpointType::Standard, "svc1", "svc1"),
            "/endpoints/deployment/svc1/svc1"
        );
        assert_eq!(t.render_location(EndpointType::Alias, "svc1", "ui"), "/endpoints/alias/ui");
        assert_eq!(t.render_location(EndpointType::DefaultGui, "svc1", ""), "/");
        assert_eq!(
            t.render_rewrite(EndpointType::Standard, "svc1", "api").as_deref(),
            Some("/endpoints/deployment/svc1/api(.*) /$1 break")
        );
        assert!(t.render_rewrite(EndpointType::DefaultGui, "svc1", "").is_none());
    }

    #[test]
    fn test_upstream_target_port_handling() {
        let t = Templates::default();
        let mut e = t.new_endpoint(EndpointType::Standard, "", base("svc1", "svc1"));
        let var = upstream_var(&e.id);
        assert_eq!(t.render_upstream_target(&e), format!("http://{}/$1$is_args$args", var));
        e.base.port = Some(80);
        assert_eq!(t.render_upstream_target(&e), format!("http://{}/$1$is_args$args", var));
        e.base.port = Some(8080);
        e.base.int_path = "/api".to_string();
        assert_eq!(t.render_upstream_target(&e), format!("http://{}:8080/api$1$is_args$args", var));
    }

    #[test]
    fn test_headers_with_location_and_websocket() {
        let t = Templates::default();
        let mut b = base("svc1", "svc1");
        b.proxy_conf.headers.insert("X-Base".to_string(), "{loc}/".to_string());
        b.proxy_conf.websocket = true;
        b.proxy_conf.read_timeout = Duration::from_secs(90);
        let e = t.new_endpoint(EndpointType::Standard, "", b);

        let headers = render_headers(&e);
        assert!(headers.contains(&("X-Base".to_string(), "/endpoints/deployment/svc1/svc1/".to_string())));
        assert!(headers.contains(&("Upgrade".to_string(), "$http_upgrade".to_string())));
        assert!(headers.contains(&("Connection".to_string(), "$connection_upgrade".to_string())));

        let directives = render_header_directives(&e);
        assert_eq!(directives[0].name, PROXY_HTTP_VERSION_DIRECTIVE);
        assert_eq!(directives[1].name, PROXY_READ_TIMEOUT_DIRECTIVE);
        assert_eq!(directives[1].parameters, vec!["90s"]);
        assert_eq!(directives.len(), 5);
    }

    #[test]
    fn test_substitution_directives() {
        let t = Templates::default();
        let mut b = base("svc1", "svc1");
        assert!(render_substitution_directives(&t.new_endpoint(EndpointType::Standard, "", b.clone())).is_empty());

        b.string_sub.filters = vec![
            SubFilter { pattern: "href=\"/".to_string(), replacement: "href=\"{loc}/".to_string() },
            SubFilter { pattern: "it's".to_string(), replacement: "x".to_string() },
        ];
        let e = t.new_endpoint(EndpointType::Standard, "", b.clone());
        let d = render_substitution_directives(&e);
        assert_eq!(d.len(), 4);
        assert_eq!(d[0].parameters, vec!["'href=\"/'", "'href=\"/endpoints/deployment/svc1/svc1/'"]);
        assert_eq!(d[1].parameters, vec!["'it\\'s'", "'x'"]);
        assert_eq!(d[2].parameters, vec!["*"]);
        assert_eq!(d[3].parameters, vec!["off"]);

        b.string_sub.mime_types = vec!["text/html".to_string(), "text/css".to_string()];
        b.string_sub.replace_once = true;
        let d = render_substitution_directives(&t.new_endpoint(EndpointType::Standard, "", b));
        assert_eq!(d[2].parameters, vec!["text/html", "text/css"]);
        assert_eq!(d[3].parameters, vec!["on"]);
    }

    #[test]
    fn test_default_gui_block_is_minimal() {
        let t = Templates::default();
        let mut b = base("svc1", "");
        b.proxy_conf.websocket = true;
        let e = t.new_endpoint(EndpointType::DefaultGui, "parent", b);
        let block = t.render_location_block(&e, "meta".to_string());
        assert_eq!(block.parameters, vec!["/"]);
        let inner = block.block.unwrap();
        let names: Vec<_> = inner.directives.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![SET_DIRECTIVE, PROXY_PASS_DIRECTIVE]);
        assert_eq!(inner.directives[0].comments, vec!["meta"]);
    }

    #[test]
    fn test_format_timeout() {
        assert_eq!(format_timeout(Duration::from_secs(30)), "30s");
        assert_eq!(format_timeout(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_timeout(Duration::from_nanos(10)), "1ms");
    }
}
