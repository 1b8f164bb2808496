use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Отступ при выводе блока
const INDENT: &str = "    ";

/// Ошибки разбора конфига nginx
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: unexpected '{token}'")]
    Unexpected { line: usize, token: String },
    #[error("line {line}: unterminated quoted string")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: directive '{name}' is missing ';' or '{{'")]
    MissingTerminator { line: usize, name: String },
    #[error("unexpected end of file, {0} block(s) not closed")]
    UnclosedBlock(usize),
}

/// Директива: имя, параметры, комментарии и опциональный вложенный блок
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    /// Параметры хранятся как в файле (кавычки сохраняются)
    pub parameters: Vec<String>,
    /// Текст комментариев без ведущего '#'
    pub comments: Vec<String>,
    pub block: Option<Block>,
}

/// Последовательность директив
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub directives: Vec<Directive>,
    /// Комментарии перед закрывающей скобкой или в конце файла
    pub trailing_comments: Vec<String>,
}

/// Дерево директив всего файла
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NginxConfig {
    pub block: Block,
}

impl Directive {
    pub fn new(name: &str, parameters: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            parameters,
            comments: Vec::new(),
            block: None,
        }
    }

    pub fn with_comment(mut self, comment: String) -> Self {
        self.comments.push(comment);
        self
    }

    pub fn with_block(mut self, directives: Vec<Directive>) -> Self {
        self.block = Some(Block { directives, trailing_comments: Vec::new() });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Semicolon,
    Open,
    Close,
    Comment(String),
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(content: &'a str) -> Self {
        Self { chars: content.chars().peekable(), line: 1 }
    }

    /// Следующий токен и номер строки, на которой он начался
    fn next_token(&mut self) -> Result<Option<(Token, usize)>, ParseError> {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                self.line += 1;
                self.chars.next();
            } else if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
        let line = self.line;
        let c = match self.chars.next() {
            Some(c) => c,
            None => return Ok(None),
        };
        let token = match c {
            ';' => Token::Semicolon,
            '{' => Token::Open,
            '}' => Token::Close,
            '#' => {
                let mut text = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    self.chars.next();
                }
                Token::Comment(text.trim_end().to_string())
            }
            '"' | '\'' => Token::Word(self.quoted(c, line)?),
            _ => {
                let mut word = String::from(c);
                while let Some(&c) = self.chars.peek() {
                    if c.is_whitespace() || matches!(c, ';' | '{' | '}') {
                        break;
                    }
                    if c == '\\' {
                        word.push(c);
                        self.chars.next();
                        if let Some(escaped) = self.chars.next() {
                            word.push(escaped);
                        }
                        continue;
                    }
                    word.push(c);
                    self.chars.next();
                }
                Token::Word(word)
            }
        };
        Ok(Some((token, line)))
    }

    fn quoted(&mut self, quote: char, start: usize) -> Result<String, ParseError> {
        let mut word = String::from(quote);
        loop {
            match self.chars.next() {
                Some('\\') => {
                    word.push('\\');
                    match self.chars.next() {
                        Some(c) => {
                            if c == '\n' {
                                self.line += 1;
                            }
                            word.push(c);
                        }
                        None => return Err(ParseError::UnterminatedQuote { line: start }),
                    }
                }
                Some(c) if c == quote => {
                    word.push(c);
                    return Ok(word);
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    word.push(c);
                }
                None => return Err(ParseError::UnterminatedQuote { line: start }),
            }
        }
    }
}

/// Директива в процессе сборки
struct Pending {
    name: String,
    parameters: Vec<String>,
    comments: Vec<String>,
    line: usize,
}

/// Уровень вложенности: блок и директива, открывшая его
struct Frame {
    block: Block,
    owner: Option<Directive>,
    owner_line: usize,
}

impl NginxConfig {
    /// Читает и разбирает файл конфигурации
    pub fn parse_config_file<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let content = fs::read_to_string(path)?;
        Self::parse_config_content(&content)
    }

    /// Разбирает содержимое конфига в дерево директив
    pub fn parse_config_content(content: &str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(content);
        let mut stack = vec![Frame { block: Block::default(), owner: None, owner_line: 0 }];
        let mut pending: Option<Pending> = None;
        let mut comments: Vec<String> = Vec::new();
        // строка, на которой завершилась последняя директива, и была ли она блоком
        let mut last_end: Option<(usize, bool)> = None;

        while let Some((token, line)) = lexer.next_token()? {
            match token {
                Token::Comment(text) => {
                    if pending.is_some() {
                        // комментарий внутри директивы относится к ней
                        if let Some(p) = pending.as_mut() {
                            p.comments.push(text);
                        }
                        continue;
                    }
                    let frame = stack.last_mut().ok_or(ParseError::UnclosedBlock(0))?;
                    match last_end {
                        Some((end_line, false)) if end_line == line && comments.is_empty() => {
                            if let Some(d) = frame.block.directives.last_mut() {
                                d.comments.push(text);
                                continue;
                            }
                            comments.push(text);
                        }
                        Some((end_line, true)) if end_line == line && comments.is_empty() => {
                            match frame.owner.as_mut() {
                                Some(owner) => owner.comments.push(text),
                                None => comments.push(text),
                            }
                        }
                        _ => comments.push(text),
                    }
                }
                Token::Word(word) => match pending.as_mut() {
                    Some(p) => p.parameters.push(word),
                    None => {
                        pending = Some(Pending {
                            name: word,
                            parameters: Vec::new(),
                            comments: std::mem::take(&mut comments),
                            line,
                        });
                    }
                },
                Token::Semicolon => {
                    let p = pending.take().ok_or(ParseError::Unexpected { line, token: ";".into() })?;
                    let frame = stack.last_mut().ok_or(ParseError::UnclosedBlock(0))?;
                    frame.block.directives.push(Directive {
                        name: p.name,
                        parameters: p.parameters,
                        comments: p.comments,
                        block: None,
                    });
                    last_end = Some((line, false));
                }
                Token::Open => {
                    let p = pending.take().ok_or(ParseError::Unexpected { line, token: "{".into() })?;
                    stack.push(Frame {
                        block: Block::default(),
                        owner: Some(Directive {
                            name: p.name,
                            parameters: p.parameters,
                            comments: p.comments,
                            block: None,
                        }),
                        owner_line: p.line,
                    });
                    last_end = Some((line, true));
                }
                Token::Close => {
                    if let Some(p) = pending.take() {
                        return Err(ParseError::MissingTerminator { line: p.line, name: p.name });
                    }
                    if stack.len() < 2 {
                        return Err(ParseError::Unexpected { line, token: "}".into() });
                    }
                    let mut frame = stack.pop().ok_or(ParseError::UnclosedBlock(0))?;
                    frame.block.trailing_comments = std::mem::take(&mut comments);
                    let mut owner = frame.owner.take().ok_or(ParseError::Unexpected { line, token: "}".into() })?;
                    owner.block = Some(frame.block);
                    let parent = stack.last_mut().ok_or(ParseError::UnclosedBlock(0))?;
                    parent.block.directives.push(owner);
                    last_end = Some((line, false));
                }
            }
        }

        if let Some(p) = pending {
            return Err(ParseError::MissingTerminator { line: p.line, name: p.name });
        }
        if stack.len() > 1 {
            let open = stack.len() - 1;
            let line = stack.last().map(|f| f.owner_line).unwrap_or_default();
            log::debug!("unclosed block opened at line {}", line);
            return Err(ParseError::UnclosedBlock(open));
        }
        let mut root = stack.pop().ok_or(ParseError::UnclosedBlock(0))?;
        root.block.trailing_comments = comments;
        Ok(NginxConfig { block: root.block })
    }

    /// Выводит дерево в текст с отступами
    pub fn dump(&self) -> String {
        let mut out = String::new();
        dump_block(&mut out, &self.block, 0);
        out
    }

    /// Обходит все директивы дерева в глубину
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Directive, &[&'a Directive])) {
        let mut parents = Vec::new();
        walk_block(&self.block, &mut parents, f);
    }

    /// Директивы верхнего уровня с заданным именем
    pub fn find_directives<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Directive> + 'a {
        self.block.directives.iter().filter(move |d| d.name == name)
    }
}

fn walk_block<'a>(
    block: &'a Block,
    parents: &mut Vec<&'a Directive>,
    f: &mut dyn FnMut(&'a Directive, &[&'a Directive]),
) {
    for directive in &block.directives {
        f(directive, parents);
        if let Some(inner) = &directive.block {
            parents.push(directive);
            walk_block(inner, parents, f);
            parents.pop();
        }
    }
}

fn dump_block(out: &mut String, block: &Block, depth: usize) {
    let indent = INDENT.repeat(depth);
    for directive in &block.directives {
        for comment in &directive.comments {
            let _ = writeln!(out, "{}#{}", indent, comment);
        }
        out.push_str(&indent);
        out.push_str(&directive.name);
        for param in &directive.parameters {
            out.push(' ');
            out.push_str(param);
        }
        match &directive.block {
            Some(inner) => {
                out.push_str(" {\n");
                dump_block(out, inner, depth + 1);
                out.push_str(&indent);
                out.push_str("}\n");
            }
            None => out.push_str(";\n"),
        }
    }
    for comment in &block.trailing_comments {
        let _ = writeln!(out, "{}#{}", indent, comment);
    }
}

/// Берет параметр в двойные кавычки, если без них nginx разберет его неверно
pub fn quote_param(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\''));
    if !needs_quotes {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Берет параметр в одинарные кавычки (для sub_filter)
pub fn single_quote_param(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let config_content = r#"
            server {
                listen 80;
                server_name example.com;

                location / {
                    proxy_pass http://backend;
                }
            }
        "#;

        let config = NginxConfig::parse_config_content(config_content).unwrap();
        assert_eq!(config.block.directives.len(), 1);

        let server = &config.block.directives[0];
        assert_eq!(server.name, "server");
        let inner = server.block.as_ref().unwrap();
        assert_eq!(inner.directives.len(), 3);
        assert_eq!(inner.directives[1].parameters, vec!["example.com"]);

        let location = &inner.directives[2];
        assert_eq!(location.name, "location");
        assert_eq!(location.parameters, vec!["/"]);
        let loc_block = location.block.as_ref().unwrap();
        assert_eq!(loc_block.directives[0].name, "proxy_pass");
    }

    #[test]
    fn test_comment_attachment() {
        let content = "#first\n#second\nlocation /a {\n    set $va host; #inline\n    #tail\n}\n#eof\n";
        let config = NginxConfig::parse_config_content(content).unwrap();
        let location = &config.block.directives[0];
        assert_eq!(location.comments, vec!["first", "second"]);
        let inner = location.block.as_ref().unwrap();
        assert_eq!(inner.directives[0].comments, vec!["inline"]);
        assert_eq!(inner.trailing_comments, vec!["tail"]);
        assert_eq!(config.block.trailing_comments, vec!["eof"]);
    }

    #[test]
    fn test_comment_after_open_brace_attaches_to_owner() {
        let content = "location /a { #meta\n    proxy_pass http://x;\n}\n";
        let config = NginxConfig::parse_config_content(content).unwrap();
        assert_eq!(config.block.directives[0].comments, vec!["meta"]);
    }

    #[test]
    fn test_quoted_parameters_kept() {
        let content = "sub_filter 'a b;c' \"x \\\" y\";\n";
        let config = NginxConfig::parse_config_content(content).unwrap();
        let d = &config.block.directives[0];
        assert_eq!(d.parameters, vec!["'a b;c'", "\"x \\\" y\""]);
    }

    #[test]
    fn test_dump_roundtrip() {
        let content = "#meta\nlocation /endpoints/x/ {\n    set $vabc svc1;\n    rewrite /x(.*) /$1 break;\n    proxy_set_header Host \"a b\";\n    proxy_pass http://$vabc$1$is_args$args;\n}\n";
        let config = NginxConfig::parse_config_content(content).unwrap();
        let dumped = config.dump();
        assert_eq!(dumped, content);
        let again = NginxConfig::parse_config_content(&dumped).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            NginxConfig::parse_config_content("location / {\n proxy_pass x;\n"),
            Err(ParseError::UnclosedBlock(1))
        ));
        assert!(matches!(
            NginxConfig::parse_config_content("}\n"),
            Err(ParseError::Unexpected { line: 1, .. })
        ));
        assert!(matches!(
            NginxConfig::parse_config_content("set $a 'b;\n"),
            Err(ParseError::UnterminatedQuote { line: 1 })
        ));
        assert!(matches!(
            NginxConfig::parse_config_content("location / {\n proxy_pass x\n}\n"),
            Err(ParseError::MissingTerminator { line: 2, .. })
        ));
    }

    #[test]
    fn test_empty_content() {
        let config = NginxConfig::parse_config_content("").unwrap();
        assert!(config.block.directives.is_empty());
        assert_eq!(config.dump(), "");
    }

    #[test]
    fn test_quote_param() {
        assert_eq!(quote_param("$http_upgrade"), "$http_upgrade");
        assert_eq!(quote_param("a b"), "\"a b\"");
        assert_eq!(quote_param("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_param(""), "\"\"");
        assert_eq!(single_quote_param("it's"), "'it\\'s'");
    }
}
