use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Роль endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EndpointType {
    /// Самостоятельно объявленный путь
    Standard,
    /// Дополнительный путь к цели существующего Standard endpoint
    Alias,
    /// Корневой путь прокси ("/")
    DefaultGui,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Standard => "standard",
            EndpointType::Alias => "alias",
            EndpointType::DefaultGui => "default_gui",
        }
    }
}

impl From<EndpointType> for u8 {
    fn from(t: EndpointType) -> u8 {
        match t {
            EndpointType::Standard => 1,
            EndpointType::Alias => 2,
            EndpointType::DefaultGui => 3,
        }
    }
}

impl TryFrom<u8> for EndpointType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(EndpointType::Standard),
            2 => Ok(EndpointType::Alias),
            3 => Ok(EndpointType::DefaultGui),
            _ => Err(format!("unknown endpoint type {}", v)),
        }
    }
}

impl std::str::FromStr for EndpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" | "1" => Ok(EndpointType::Standard),
            "alias" | "2" => Ok(EndpointType::Alias),
            "default_gui" | "default-gui" | "3" => Ok(EndpointType::DefaultGui),
            _ => Err(format!("unknown endpoint type '{}'", s)),
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Настройки проксирования
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConf {
    #[serde(deserialize_with = "null_default")]
    pub headers: BTreeMap<String, String>,
    pub websocket: bool,
    /// Хранится в наносекундах
    #[serde(with = "duration_nanos")]
    pub read_timeout: Duration,
}

/// Одно правило подстановки в теле ответа
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFilter {
    pub pattern: String,
    pub replacement: String,
}

/// Подстановка строк в теле ответа (sub_filter)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringSub {
    /// false -> заменять повторно
    pub replace_once: bool,
    /// Пусто -> все типы
    #[serde(deserialize_with = "null_default")]
    pub mime_types: Vec<String>,
    /// Порядок правил сохраняется
    #[serde(with = "ordered_filters")]
    pub filters: Vec<SubFilter>,
}

/// Данные endpoint, которые задает вызывающая сторона
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointBase {
    #[serde(rename = "ref")]
    pub reference: String,
    pub host: String,
    pub port: Option<u16>,
    pub int_path: String,
    pub ext_path: String,
    pub proxy_conf: ProxyConf,
    pub string_sub: StringSub,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
}

/// Endpoint со всеми производными полями
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(flatten)]
    pub base: EndpointBase,
}

impl Endpoint {
    /// ID endpoint: детерминированный хеш отрендеренного location
    pub fn derive_id(location: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, location.as_bytes())
            .simple()
            .to_string()
    }

    pub fn is_standard(&self) -> bool {
        self.endpoint_type == EndpointType::Standard
    }
}

/// Endpoints по ID. Порядок ключей задает порядок блоков в конфиге.
pub type EndpointMap = BTreeMap<String, Endpoint>;

/// Фильтр для List / RemoveAll. Пустые поля не ограничивают выборку.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointFilter {
    pub ids: Vec<String>,
    pub endpoint_type: Option<EndpointType>,
    pub reference: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl EndpointFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
            && self.endpoint_type.is_none()
            && self.reference.as_deref().map_or(true, str::is_empty)
            && self.labels.is_empty()
    }

    pub fn matches(&self, ids: &HashSet<&str>, endpoint: &Endpoint) -> bool {
        if !ids.is_empty() && !ids.contains(endpoint.id.as_str()) {
            return false;
        }
        if let Some(t) = self.endpoint_type {
            if endpoint.endpoint_type != t {
                return false;
            }
        }
        if let Some(r) = self.reference.as_deref().filter(|r| !r.is_empty()) {
            if endpoint.base.reference != r {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| endpoint.base.labels.get(k) == Some(v))
    }
}

/// Состояние контейнера сервиса
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvContainer {
    pub name: String,
    pub id: Option<String>,
    pub state: Option<String>,
}

/// Сервис ядра (из compose файла)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreService {
    pub name: String,
    pub container: SrvContainer,
}

/// Лог файл, доступный для чтения
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub id: String,
    pub service_name: String,
}

/// `null` в JSON трактуется как пустое значение
fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

mod duration_nanos {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let nanos = i64::try_from(d.as_nanos()).map_err(|_| S::Error::custom("duration out of range"))?;
        s.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        // отрицательные значения трактуем как "не задано"
        let nanos = i64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}

/// Правила хранятся JSON объектом `{"from": "to", ...}`, порядок ключей = порядок правил
mod ordered_filters {
    use super::SubFilter;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(filters: &[SubFilter], s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(filters.len()))?;
        for f in filters {
            map.serialize_entry(&f.pattern, &f.replacement)?;
        }
        map.end()
    }

    struct FiltersVisitor;

    impl<'de> Visitor<'de> for FiltersVisitor {
        type Value = Vec<SubFilter>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of substitution rules")
        }

        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut filters = Vec::new();
            while let Some((pattern, replacement)) = access.next_entry::<String, String>()? {
                filters.push(SubFilter { pattern, replacement });
            }
            Ok(filters)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<SubFilter>, D::Error> {
        d.deserialize_any(FiltersVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, t: EndpointType, reference: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            parent_id: String::new(),
            endpoint_type: t,
            location: String::new(),
            base: EndpointBase {
                reference: reference.to_string(),
                host: "svc".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_endpoint_json_field_names() {
        let mut e = endpoint("abc", EndpointType::Alias, "svc1");
        e.base.port = Some(8080);
        e.base.proxy_conf.read_timeout = Duration::from_secs(2);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["id"], "abc");
        assert_eq!(v["type"], 2);
        assert_eq!(v["ref"], "svc1");
        assert_eq!(v["port"], 8080);
        assert_eq!(v["proxy_conf"]["read_timeout"], 2_000_000_000u64);
        assert!(v.get("location").is_none());
    }

    #[test]
    fn test_decode_legacy_payload_without_optional_sections() {
        let raw = r#"{"id":"x","parent_id":"","type":1,"ref":"d1","host":"h","port":null,"int_path":"/","ext_path":"ui","labels":null}"#;
        let e: Endpoint = serde_json::from_str(raw).unwrap();
        assert_eq!(e.endpoint_type, EndpointType::Standard);
        assert_eq!(e.base.reference, "d1");
        assert!(e.base.string_sub.filters.is_empty());
        assert_eq!(e.base.proxy_conf, ProxyConf::default());
    }

    #[test]
    fn test_filters_keep_order() {
        let raw = r#"{"replace_once":true,"mime_types":null,"filters":{"z":"1","a":"2","m":"3"}}"#;
        let sub: StringSub = serde_json::from_str(raw).unwrap();
        assert!(sub.mime_types.is_empty());
        let patterns: Vec<_> = sub.filters.iter().map(|f| f.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["z", "a", "m"]);
        let back = serde_json::to_string(&sub).unwrap();
        assert!(back.contains(r#""filters":{"z":"1","a":"2","m":"3"}"#));
    }

    #[test]
    fn test_derive_id_is_stable() {
        let a = Endpoint::derive_id("/endpoints/deployment/svc1/svc1");
        let b = Endpoint::derive_id("/endpoints/deployment/svc1/svc1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, Endpoint::derive_id("/endpoints/alias/svc1"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":7,"ref":"d1","host":"h"}"#;
        assert!(serde_json::from_str::<Endpoint>(raw).is_err());
    }

    #[test]
    fn test_filter_matching() {
        let mut e = endpoint("id1", EndpointType::Standard, "svc1");
        e.base.labels.insert("env".to_string(), "prod".to_string());
        e.base.labels.insert("team".to_string(), "core".to_string());

        let no_ids = HashSet::new();
        assert!(EndpointFilter::default().matches(&no_ids, &e));

        let mut f = EndpointFilter::default();
        f.labels.insert("env".to_string(), "prod".to_string());
        assert!(f.matches(&no_ids, &e));
        f.labels.insert("env".to_string(), "dev".to_string());
        assert!(!f.matches(&no_ids, &e));

        let f = EndpointFilter { endpoint_type: Some(EndpointType::Alias), ..Default::default() };
        assert!(!f.matches(&no_ids, &e));

        let f = EndpointFilter { reference: Some("svc2".to_string()), ..Default::default() };
        assert!(!f.matches(&no_ids, &e));

        let ids: HashSet<&str> = ["other"].into_iter().collect();
        assert!(!EndpointFilter::default().matches(&ids, &e));
    }

    #[test]
    fn test_filter_is_empty() {
        assert!(EndpointFilter::default().is_empty());
        assert!(EndpointFilter { reference: Some(String::new()), ..Default::default() }.is_empty());
        assert!(!EndpointFilter { ids: vec!["a".into()], ..Default::default() }.is_empty());
    }
}
