//! Task document synchronisation library.
//! Parses plain-text task documents, reconciles them against the last-known state of a
//! remote task service and renders them back without disturbing non-task text.

pub mod core {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub String);

    impl TaskId {
        /// Fresh client-side id used until the remote assigns a permanent one.
        pub fn temporary() -> Self {
            Self(Uuid::new_v4().to_string())
        }

        /// Permanent remote ids are purely numeric.
        pub fn is_temporary(&self) -> bool {
            self.0.is_empty() || !self.0.chars().all(|c| c.is_ascii_digit())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for TaskId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ProjectId(pub String);

    impl ProjectId {
        pub fn temporary() -> Self {
            Self(Uuid::new_v4().to_string())
        }

        pub fn is_temporary(&self) -> bool {
            self.0.is_empty() || !self.0.chars().all(|c| c.is_ascii_digit())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for ProjectId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for ProjectId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ------------------------------ Paths ------------------------------ */

    /// A `/`-separated document path relative to the vault root (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocPath(pub String);

    impl DocPath {
        pub fn new(path: impl AsRef<str>) -> Self {
            Self(path.as_ref().trim_matches('/').to_string())
        }

        pub fn join(&self, segment: &str) -> Self {
            if self.0.is_empty() {
                Self::new(segment)
            } else {
                Self(format!("{}/{}", self.0, segment.trim_matches('/')))
            }
        }

        pub fn parent(&self) -> Option<Self> {
            if self.0.is_empty() {
                None
            } else {
                Some(match self.0.rsplit_once('/') {
                    Some((dir, _)) => Self(dir.to_string()),
                    None => Self(String::new()),
                })
            }
        }

        pub fn file_name(&self) -> Option<&str> {
            if self.0.is_empty() {
                None
            } else {
                self.0.rsplit('/').next()
            }
        }

        /// File name without its final extension.
        pub fn file_stem(&self) -> Option<&str> {
            let name = self.file_name()?;
            match name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => Some(stem),
                _ => Some(name),
            }
        }

        pub fn extension(&self) -> Option<&str> {
            let name = self.file_name()?;
            match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => Some(ext),
                _ => None,
            }
        }

        /// True when the path lives somewhere below `dir` (an empty `dir` is the root).
        pub fn is_within(&self, dir: &DocPath) -> bool {
            dir.0.is_empty()
                || self
                    .0
                    .strip_prefix(&dir.0)
                    .is_some_and(|rest| rest.starts_with('/'))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for DocPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Remote priority value: 1 is the remote's "normal", 4 the most urgent.
    /// Written in documents as `(pN)` where `N = 5 - value`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "u8", into = "u8")]
    pub struct Priority(u8);

    impl Priority {
        pub const DEFAULT: Priority = Priority(1);

        pub fn new(value: u8) -> Result<Self, DomainError> {
            if (1..=4).contains(&value) {
                Ok(Self(value))
            } else {
                Err(DomainError::InvalidPriority(value))
            }
        }

        /// Maps the digit of a `(pN)` token: p1 is the most urgent.
        pub fn from_token_digit(digit: u8) -> Option<Self> {
            (1..=4).contains(&digit).then(|| Self(5 - digit))
        }

        pub fn token_digit(self) -> u8 {
            5 - self.0
        }

        pub fn value(self) -> u8 {
            self.0
        }

        pub fn is_default(self) -> bool {
            self == Self::DEFAULT
        }
    }

    impl TryFrom<u8> for Priority {
        type Error = DomainError;

        fn try_from(value: u8) -> Result<Self, Self::Error> {
            Self::new(value)
        }
    }

    impl From<Priority> for u8 {
        fn from(p: Priority) -> Self {
            p.0
        }
    }

    /// Due date as exchanged with the remote. Only the calendar day takes part in diffs.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DueDate {
        pub date: NaiveDate,
        /// Humanized form, e.g. `Jan 05`.
        #[serde(rename = "string", default)]
        pub humanized: String,
        #[serde(default)]
        pub is_recurring: bool,
        #[serde(default)]
        pub timezone: Option<String>,
        #[serde(default = "DueDate::default_lang")]
        pub lang: String,
    }

    impl DueDate {
        pub fn on(date: NaiveDate) -> Self {
            Self {
                date,
                humanized: date.format("%b %d").to_string(),
                is_recurring: false,
                timezone: None,
                lang: Self::default_lang(),
            }
        }

        fn default_lang() -> String {
            "en".to_string()
        }
    }

    /// Compares optional due dates by calendar day only.
    pub fn due_dates_match(a: Option<&DueDate>, b: Option<&DueDate>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.date == b.date,
            _ => false,
        }
    }

    /// Canonical description form: backticks removed, lines trimmed, blank lines dropped.
    pub fn normalize_description(text: &str) -> String {
        text.lines()
            .map(|line| line.replace('`', ""))
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One unit of work, either parsed from a document line or received from the remote.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        /// `None` until the task exists remotely (or has been given a temporary id).
        pub id: Option<TaskId>,
        pub content: String,
        #[serde(default)]
        pub completed: bool,
        #[serde(default)]
        pub due: Option<DueDate>,
        /// `None` when the line carried no priority token and nothing resolved it yet.
        #[serde(default)]
        pub priority: Option<Priority>,
        /// Display order is kept; equality checks ignore it.
        #[serde(default)]
        pub labels: Vec<String>,
        #[serde(default)]
        pub description: String,
        #[serde(default)]
        pub project_id: Option<ProjectId>,
        /// Modification time (unix seconds) of the document the task was read from.
        #[serde(default, skip_serializing)]
        pub mtime: i64,
    }

    impl Task {
        pub fn new(content: impl Into<String>) -> Self {
            Self {
                id: None,
                content: content.into(),
                completed: false,
                due: None,
                priority: None,
                labels: vec![],
                description: String::new(),
                project_id: None,
                mtime: 0,
            }
        }

        pub fn priority_or_default(&self) -> Priority {
            self.priority.unwrap_or(Priority::DEFAULT)
        }

        /// Label comparison as a multiset.
        pub fn labels_match(&self, other: &Task) -> bool {
            let mut a = self.labels.clone();
            let mut b = other.labels.clone();
            a.sort();
            b.sort();
            a == b
        }

        /// Copies every user-editable field from `other`; reports whether anything changed.
        pub fn adopt_fields(&mut self, other: &Task) -> bool {
            let before = (
                self.content.clone(),
                self.completed,
                self.due.clone(),
                self.priority,
                self.labels.clone(),
                self.description.clone(),
            );
            self.content = other.content.clone();
            self.completed = other.completed;
            self.due = other.due.clone();
            self.priority = other.priority;
            self.labels = other.labels.clone();
            self.description = other.description.clone();
            before
                != (
                    self.content.clone(),
                    self.completed,
                    self.due.clone(),
                    self.priority,
                    self.labels.clone(),
                    self.description.clone(),
                )
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// A piece of a document body: verbatim text or a parsed task.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", content = "value", rename_all = "snake_case")]
    pub enum Fragment {
        Opaque(String),
        Task(Task),
    }

    impl Fragment {
        pub fn is_task(&self) -> bool {
            matches!(self, Fragment::Task(_))
        }

        pub fn as_task(&self) -> Option<&Task> {
            match self {
                Fragment::Task(task) => Some(task),
                Fragment::Opaque(_) => None,
            }
        }

        pub fn as_task_mut(&mut self) -> Option<&mut Task> {
            match self {
                Fragment::Task(task) => Some(task),
                Fragment::Opaque(_) => None,
            }
        }
    }

    pub type Body = Vec<Fragment>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ProjectKind {
        /// A document under the managed directory, one per remote project.
        Dedicated,
        /// A note that holds tasks captured inline (tracked by the registered-file ledger).
        Registered,
    }

    /// A project as seen during one pass, backed by a single document.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct Project {
        pub name: String,
        pub id: Option<ProjectId>,
        /// `None` for projects that only exist remotely so far.
        pub file_path: Option<DocPath>,
        pub body: Body,
        pub kind: ProjectKind,
        pub has_updates: bool,
        pub needs_rename: bool,
    }

    impl Project {
        pub fn tasks(&self) -> impl Iterator<Item = &Task> {
            self.body.iter().filter_map(Fragment::as_task)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("priority {0} is out of bounds (1..=4)")]
        InvalidPriority(u8),
    }

}

pub mod naming {
    //! Project document names: `<name> - <id>.<ext>`, both directions.

    use crate::core::{DocPath, ProjectId};
    use serde::Serialize;

    /// Characters that cannot appear in a project document name.
    pub const FORBIDDEN_CHARS: &[char] = &[
        '/', '\\', '?', '%', '*', ':', '|', '"', '<', '>', '[', ']', '#', '^',
    ];

    const ID_SEPARATOR: &str = " - ";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ProjectName {
        pub name: String,
        pub id: Option<ProjectId>,
    }

    pub fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| if FORBIDDEN_CHARS.contains(&c) { '-' } else { c })
            .collect()
    }

    /// Builds `<sanitized name>[ - <id>].<extension>`.
    pub fn to_file_name(project: &ProjectName, extension: &str) -> String {
        let mut out = sanitize(&project.name);
        if let Some(id) = &project.id {
            out.push_str(ID_SEPARATOR);
            out.push_str(id.as_str());
        }
        out.push('.');
        out.push_str(extension);
        out
    }

    pub fn project_path(directory: &DocPath, project: &ProjectName, extension: &str) -> DocPath {
        directory.join(&to_file_name(project, extension))
    }

    /// Parses a base name (directory and extension are tolerated and dropped).
    ///
    /// A trailing ` - <suffix>` only counts as an id when the suffix is all digits;
    /// otherwise it stays part of the name.
    pub fn from_file_name(base_name: &str) -> ProjectName {
        let file = base_name.rsplit('/').next().unwrap_or(base_name);
        let stem = match file.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty() && !ext.is_empty() && !ext.contains(' ') =>
            {
                stem
            }
            _ => file,
        };

        match stem.rsplit_once(ID_SEPARATOR) {
            Some((name, suffix))
                if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) =>
            {
                ProjectName {
                    name: name.to_string(),
                    id: Some(ProjectId(suffix.to_string())),
                }
            }
            _ => ProjectName {
                name: stem.to_string(),
                id: None,
            },
        }
    }

}

pub mod parser {
    //! Line-oriented task parser.
    //!
    //! Tokens may sit directly against free text, so the line scanners are explicit
    //! state machines over a [`Cursor`] that can step back one character; a failed
    //! token match hands its consumed text back to the content as literal text.
    //! Date literals inside `(@...)` are parsed with `nom`.

    use crate::core::*;
    use chrono::{Datelike, Duration, NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while,
        character::complete::char,
        combinator::{all_consuming, map_res},
        error::{VerboseError, VerboseErrorKind},
        sequence::tuple,
    };

    /// Description lines must start with a tab or this many spaces.
    pub const INDENT_WIDTH: usize = 4;

    /// Opening fence of a capture block; the block ends at the next plain fence.
    pub const CAPTURE_FENCE: &str = "```todomd";

    /// Per-line context handed down by the segmenter.
    #[derive(Debug, Clone, Copy)]
    pub struct LineContext<'a> {
        pub project_id: Option<&'a ProjectId>,
        pub mtime: i64,
        pub today: NaiveDate,
        /// Lines inside a capture block may omit the checkbox.
        pub capture: bool,
    }

    impl<'a> LineContext<'a> {
        pub fn new(today: NaiveDate) -> Self {
            Self {
                project_id: None,
                mtime: 0,
                today,
                capture: false,
            }
        }

        pub fn with_project(mut self, project_id: &'a ProjectId) -> Self {
            self.project_id = Some(project_id);
            self
        }

        pub fn with_mtime(mut self, mtime: i64) -> Self {
            self.mtime = mtime;
            self
        }

        pub fn capturing(mut self) -> Self {
            self.capture = true;
            self
        }
    }

    /* ------------------------------- Cursor ------------------------------- */

    /// Character cursor with single-step rewind.
    #[derive(Debug, Clone)]
    pub struct Cursor {
        chars: Vec<char>,
        pos: usize,
    }

    impl Cursor {
        pub fn new(input: &str) -> Self {
            Self {
                chars: input.chars().collect(),
                pos: 0,
            }
        }

        pub fn bump(&mut self) -> Option<char> {
            let c = self.chars.get(self.pos).copied();
            if c.is_some() {
                self.pos += 1;
            }
            c
        }

        pub fn peek(&self) -> Option<char> {
            self.chars.get(self.pos).copied()
        }

        /// Steps back over the last consumed character.
        pub fn rewind(&mut self) {
            self.pos = self.pos.saturating_sub(1);
        }

        /// Consumes `literal` if the remaining input starts with it.
        pub fn eat(&mut self, literal: &str) -> bool {
            let mut pos = self.pos;
            for expected in literal.chars() {
                if self.chars.get(pos) != Some(&expected) {
                    return false;
                }
                pos += 1;
            }
            self.pos = pos;
            true
        }
    }

    /* ------------------------------ Id comment ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum IdState {
        Body,
        Lt,
        Bang,
        Dash,
        Digits,
        EndDash,
        EndDashDash,
    }

    /// Pulls the first `<!--digits-->` comment out of a line.
    /// Anything that does not complete the exact shape stays in the text.
    pub fn extract_id(line: &str) -> (String, Option<TaskId>) {
        let mut cursor = Cursor::new(line);
        let mut state = IdState::Body;
        let mut body = String::new();
        let mut pending = String::new();
        let mut digits = String::new();
        let mut id = None;

        while let Some(c) = cursor.bump() {
            let next = match (state, c) {
                (IdState::Body, '<') if id.is_none() => Some(IdState::Lt),
                (IdState::Body, _) => {
                    body.push(c);
                    continue;
                }
                (IdState::Lt, '!') => Some(IdState::Bang),
                (IdState::Bang, '-') => Some(IdState::Dash),
                (IdState::Dash, '-') => Some(IdState::Digits),
                (IdState::Digits, d) if d.is_ascii_digit() => {
                    digits.push(d);
                    Some(IdState::Digits)
                }
                (IdState::Digits, '-') if !digits.is_empty() => Some(IdState::EndDash),
                (IdState::EndDash, '-') => Some(IdState::EndDashDash),
                (IdState::EndDashDash, '>') => {
                    id = Some(TaskId(std::mem::take(&mut digits)));
                    pending.clear();
                    state = IdState::Body;
                    continue;
                }
                _ => None,
            };
            match next {
                Some(s) => {
                    pending.push(c);
                    state = s;
                }
                None => {
                    body.push_str(&pending);
                    pending.clear();
                    digits.clear();
                    cursor.rewind();
                    state = IdState::Body;
                }
            }
        }
        body.push_str(&pending);
        (body, id)
    }

    /* ------------------------------ Markup tags ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TagState {
        Data,
        OpenName,
        Attributes,
        SelfClose,
        CloseName,
    }

    /// Removes well-formed HTML tags (e.g. color spans), keeping their inner text.
    /// Unterminated tags and unmatched closing tags are kept as literal text.
    pub fn strip_tags(text: &str) -> String {
        let mut cursor = Cursor::new(text);
        let mut state = TagState::Data;
        let mut out = String::new();
        let mut raw = String::new();
        let mut name = String::new();
        let mut quote: Option<char> = None;
        let mut open: Vec<String> = Vec::new();

        while let Some(c) = cursor.bump() {
            state = match state {
                TagState::Data => {
                    if c == '<' && cursor.peek().is_some_and(|n| n.is_ascii_alphabetic()) {
                        raw.push(c);
                        TagState::OpenName
                    } else if c == '<' && cursor.peek() == Some('/') {
                        cursor.bump();
                        if cursor.peek().is_some_and(|n| n.is_ascii_alphabetic()) {
                            raw.push_str("</");
                            TagState::CloseName
                        } else {
                            cursor.rewind();
                            out.push(c);
                            TagState::Data
                        }
                    } else {
                        out.push(c);
                        TagState::Data
                    }
                }
                TagState::OpenName => match c {
                    c if c.is_ascii_alphanumeric() => {
                        raw.push(c);
                        name.push(c);
                        TagState::OpenName
                    }
                    ' ' | '\t' => {
                        raw.push(c);
                        TagState::Attributes
                    }
                    '/' => {
                        raw.push(c);
                        TagState::SelfClose
                    }
                    '>' => {
                        open.push(std::mem::take(&mut name));
                        raw.clear();
                        TagState::Data
                    }
                    _ => {
                        out.push_str(&raw);
                        raw.clear();
                        name.clear();
                        cursor.rewind();
                        TagState::Data
                    }
                },
                TagState::Attributes => {
                    raw.push(c);
                    match (quote, c) {
                        (Some(q), c) if c == q => quote = None,
                        (Some(_), _) => {}
                        (None, '"' | '\'') => quote = Some(c),
                        (None, '>') => {
                            if raw.ends_with("/>") {
                                name.clear();
                            } else {
                                open.push(std::mem::take(&mut name));
                            }
                            raw.clear();
                            state = TagState::Data;
                            continue;
                        }
                        (None, _) => {}
                    }
                    TagState::Attributes
                }
                TagState::SelfClose => {
                    if c == '>' {
                        raw.clear();
                        name.clear();
                    } else {
                        out.push_str(&raw);
                        raw.clear();
                        name.clear();
                        cursor.rewind();
                    }
                    TagState::Data
                }
                TagState::CloseName => match c {
                    c if c.is_ascii_alphanumeric() => {
                        raw.push(c);
                        name.push(c);
                        TagState::CloseName
                    }
                    '>' => {
                        match open.iter().rposition(|n| n.eq_ignore_ascii_case(&name)) {
                            Some(at) => open.truncate(at),
                            None => {
                                out.push_str(&raw);
                                out.push('>');
                            }
                        }
                        raw.clear();
                        name.clear();
                        TagState::Data
                    }
                    _ => {
                        out.push_str(&raw);
                        raw.clear();
                        name.clear();
                        cursor.rewind();
                        TagState::Data
                    }
                },
            };
        }
        out.push_str(&raw);
        out
    }

    /* ------------------------------ Task lines ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum LineState {
        Bullet,
        BulletSpace,
        OpenBracket,
        Check,
        CloseBracket,
        BeforeContent,
        Content,
        Space,
        OpenParen,
        Priority,
        AfterPriority(u8),
        Due,
        Label,
    }

    /// Parses one document line into a task, or `None` when it is not a task line.
    ///
    /// Grammar: `- [ ] content [(pN)] [(@due)] [#label ...] [<!--id-->]`, where the
    /// tokens may appear anywhere after the checkbox. A space directly before a
    /// recognized token is dropped together with the token.
    pub fn parse_line(line: &str, ctx: &LineContext<'_>) -> Option<Task> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return None;
        }
        let (body, id) = extract_id(line);
        let body = strip_tags(&body);

        let mut cursor = Cursor::new(&body);
        let mut state = LineState::Bullet;
        let mut completed = false;
        let mut content = String::new();
        let mut pending = String::new();
        let mut due_expr = String::new();
        let mut label = String::new();
        let mut due = None;
        let mut priority = None;
        let mut labels = Vec::new();

        while let Some(c) = cursor.bump() {
            state = match state {
                LineState::Bullet if c == '-' => LineState::BulletSpace,
                LineState::BulletSpace if c == ' ' && ctx.capture => {
                    if cursor.eat("[x] ") || cursor.eat("[X] ") {
                        completed = true;
                    } else {
                        cursor.eat("[ ] ");
                    }
                    LineState::Content
                }
                LineState::BulletSpace if c == ' ' => LineState::OpenBracket,
                LineState::OpenBracket if c == '[' => LineState::Check,
                LineState::Check if c == 'x' || c == 'X' => {
                    completed = true;
                    LineState::CloseBracket
                }
                LineState::Check if c == ' ' => LineState::CloseBracket,
                LineState::CloseBracket if c == ']' => LineState::BeforeContent,
                LineState::BeforeContent if c == ' ' => LineState::Content,
                LineState::Bullet
                | LineState::BulletSpace
                | LineState::OpenBracket
                | LineState::Check
                | LineState::CloseBracket
                | LineState::BeforeContent => return None,

                LineState::Content => match c {
                    ' ' => {
                        pending.push(c);
                        LineState::Space
                    }
                    '(' => {
                        pending.push(c);
                        LineState::OpenParen
                    }
                    '#' if starts_label(&cursor) => LineState::Label,
                    _ => {
                        content.push(c);
                        LineState::Content
                    }
                },
                LineState::Space => match c {
                    '(' => {
                        pending.push(c);
                        LineState::OpenParen
                    }
                    '#' if starts_label(&cursor) => {
                        pending.clear();
                        LineState::Label
                    }
                    _ => literal(&mut content, &mut pending, &mut cursor),
                },
                LineState::OpenParen => match c {
                    'p' => {
                        pending.push(c);
                        LineState::Priority
                    }
                    '@' => {
                        pending.push(c);
                        LineState::Due
                    }
                    _ => literal(&mut content, &mut pending, &mut cursor),
                },
                LineState::Priority => match c.to_digit(10) {
                    Some(d @ 1..=4) => {
                        pending.push(c);
                        LineState::AfterPriority(d as u8)
                    }
                    _ => literal(&mut content, &mut pending, &mut cursor),
                },
                LineState::AfterPriority(digit) if c == ')' => {
                    priority = Priority::from_token_digit(digit);
                    pending.clear();
                    LineState::Content
                }
                LineState::AfterPriority(_) => literal(&mut content, &mut pending, &mut cursor),
                LineState::Due if c == ')' => {
                    match resolve_due_expression(&due_expr, ctx.today) {
                        Some(parsed) => due = Some(parsed),
                        None => {
                            pending.push(c);
                            content.push_str(&pending);
                        }
                    }
                    pending.clear();
                    due_expr.clear();
                    LineState::Content
                }
                LineState::Due => {
                    pending.push(c);
                    due_expr.push(c);
                    LineState::Due
                }
                LineState::Label if c.is_ascii_alphabetic() => {
                    label.push(c);
                    LineState::Label
                }
                LineState::Label => {
                    labels.push(std::mem::take(&mut label));
                    cursor.rewind();
                    LineState::Content
                }
            };
        }

        match state {
            LineState::Bullet
            | LineState::BulletSpace
            | LineState::OpenBracket
            | LineState::Check
            | LineState::CloseBracket
            | LineState::BeforeContent => return None,
            LineState::Label => labels.push(label),
            _ => content.push_str(&pending),
        }

        let content = content.trim();
        if content.is_empty() {
            return None;
        }

        Some(Task {
            id,
            content: content.to_string(),
            completed,
            due,
            priority,
            labels,
            description: String::new(),
            project_id: ctx.project_id.cloned(),
            mtime: ctx.mtime,
        })
    }

    fn starts_label(cursor: &Cursor) -> bool {
        cursor.peek().is_some_and(|c| c.is_ascii_alphabetic())
    }

    /// Gives the text consumed by a failed token back to the content and lets the
    /// content state look at the current character again.
    fn literal(content: &mut String, pending: &mut String, cursor: &mut Cursor) -> LineState {
        content.push_str(pending);
        pending.clear();
        cursor.rewind();
        LineState::Content
    }

    /* ------------------------------ Due dates ------------------------------ */

    /// Resolves the inside of a `(@...)` token relative to `today`.
    pub fn resolve_due_expression(expr: &str, today: NaiveDate) -> Option<DueDate> {
        let normalized = expr.trim().to_lowercase();
        let date = match normalized.as_str() {
            "today" => today,
            "tomorrow" => today + Duration::days(1),
            "next week" => today + Duration::days(7),
            other => {
                if let Some(day) = other.strip_prefix("next ").and_then(weekday_from_name) {
                    let ahead = days_until(today, day);
                    today + Duration::days(if ahead == 0 { 7 } else { ahead })
                } else if let Some(day) = weekday_from_name(other) {
                    today + Duration::days(days_until(today, day))
                } else {
                    parse_date_literal(other)?
                }
            }
        };
        Some(DueDate::on(date))
    }

    fn weekday_from_name(name: &str) -> Option<Weekday> {
        match name {
            "monday" => Some(Weekday::Mon),
            "tuesday" => Some(Weekday::Tue),
            "wednesday" => Some(Weekday::Wed),
            "thursday" => Some(Weekday::Thu),
            "friday" => Some(Weekday::Fri),
            "saturday" => Some(Weekday::Sat),
            "sunday" => Some(Weekday::Sun),
            _ => None,
        }
    }

    /// Days from `today` to the next `target` weekday, 0 when it is today.
    fn days_until(today: NaiveDate, target: Weekday) -> i64 {
        let from = today.weekday().num_days_from_monday() as i64;
        let to = target.num_days_from_monday() as i64;
        (to - from).rem_euclid(7)
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// `YYYY-MM-DD` or `YYYY/MM/DD`; month and day may be one or two digits.
    pub fn parse_date_literal(input: &str) -> Option<NaiveDate> {
        all_consuming(date_literal)(input.trim()).ok().map(|(_, d)| d)
    }

    fn date_literal(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                alt((char('-'), char('/'))),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                alt((char('-'), char('/'))),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (rest, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    /* ------------------------------ Segmenter ------------------------------ */

    /// Splits on `\n`; a trailing newline does not produce an extra empty line.
    pub fn split_lines(text: &str) -> Vec<&str> {
        let mut lines: Vec<&str> = text.split('\n').collect();
        if lines.last() == Some(&"") {
            lines.pop();
        }
        lines
    }

    fn is_indented(line: &str) -> bool {
        line.starts_with('\t') || line.starts_with(&" ".repeat(INDENT_WIDTH))
    }

    /// Turns document lines into a body of opaque runs and tasks.
    pub fn segment(lines: &[&str], ctx: &LineContext<'_>) -> Body {
        segment_with(lines, ctx, |_| true)
    }

    /// Like [`segment`], but task lines rejected by `accept` are kept as opaque text.
    pub fn segment_with<F>(lines: &[&str], ctx: &LineContext<'_>, mut accept: F) -> Body
    where
        F: FnMut(&Task) -> bool,
    {
        let mut body = Vec::new();
        let mut opaque = String::new();
        let mut current: Option<Task> = None;
        let mut description: Vec<String> = Vec::new();

        for line in lines {
            if let Some(task) = parse_line(line, ctx).filter(|t| accept(t)) {
                flush_task(&mut body, &mut current, &mut description);
                flush_opaque(&mut body, &mut opaque);
                current = Some(task);
                continue;
            }
            if current.is_some() && is_indented(line) {
                let text = line.trim_end_matches('\r').replace('`', "");
                let text = text.trim();
                if !text.is_empty() {
                    description.push(text.to_string());
                }
                continue;
            }
            flush_task(&mut body, &mut current, &mut description);
            opaque.push_str(line);
            opaque.push('\n');
        }
        flush_task(&mut body, &mut current, &mut description);
        flush_opaque(&mut body, &mut opaque);
        body
    }

    fn flush_task(body: &mut Body, current: &mut Option<Task>, description: &mut Vec<String>) {
        if let Some(mut task) = current.take() {
            task.description = description.join("\n");
            body.push(Fragment::Task(task));
        }
        description.clear();
    }

    fn flush_opaque(body: &mut Body, opaque: &mut String) {
        if !opaque.is_empty() {
            body.push(Fragment::Opaque(std::mem::take(opaque)));
        }
    }

    /* ---------------------------- Capture blocks ---------------------------- */

    /// A fenced capture block; `start` and `end` are the fence line indexes
    /// (`end` is the last line of the document when the block is unterminated).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CaptureBlock {
        pub start: usize,
        pub end: usize,
        pub lines: Vec<String>,
    }

    pub fn find_capture_blocks(lines: &[&str]) -> Vec<CaptureBlock> {
        let mut blocks = Vec::new();
        let mut open: Option<(usize, Vec<String>)> = None;
        for (index, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            match open.as_mut() {
                None if trimmed == CAPTURE_FENCE => open = Some((index, Vec::new())),
                None => {}
                Some((start, body)) if trimmed == "```" => {
                    blocks.push(CaptureBlock {
                        start: *start,
                        end: index,
                        lines: std::mem::take(body),
                    });
                    open = None;
                }
                Some((_, body)) => body.push(line.to_string()),
            }
        }
        if let Some((start, body)) = open {
            blocks.push(CaptureBlock {
                start,
                end: lines.len().saturating_sub(1),
                lines: body,
            });
        }
        blocks
    }

    /// One meaningful line inside a capture block.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CaptureLine {
        Task(Task),
        /// `@name` switches the target project for the following tasks.
        Project(String),
        /// `:text` sets the description of the preceding task.
        Description(String),
        /// Anything else is a remote filter query.
        Filter(String),
    }

    pub fn parse_capture_line(line: &str, ctx: &LineContext<'_>) -> Option<CaptureLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(task) = parse_line(line, &ctx.capturing()) {
            return Some(CaptureLine::Task(task));
        }
        if let Some(name) = line.strip_prefix('@') {
            return Some(CaptureLine::Project(name.trim().to_string()));
        }
        if let Some(text) = line.strip_prefix(':') {
            return Some(CaptureLine::Description(text.trim().to_string()));
        }
        Some(CaptureLine::Filter(line.to_string()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        // 2024-03-13 is a Wednesday.
        fn ctx() -> LineContext<'static> {
            LineContext::new(day(2024, 3, 13))
        }

        #[test]
        fn full_line_with_every_token() {
            let task = parse_line(
                "- [ ] Write report (p2) (@tomorrow) #work <!--123-->",
                &ctx(),
            )
            .expect("parse");
            assert_eq!(task.content, "Write report");
            assert_eq!(task.priority.map(Priority::value), Some(3));
            assert_eq!(task.due.expect("due").date, day(2024, 3, 14));
            assert_eq!(task.labels, vec!["work".to_string()]);
            assert_eq!(task.id, Some(TaskId::from("123")));
            assert!(!task.completed);
        }

        #[test]
        fn completed_box_and_plain_content() {
            let task = parse_line("- [x] Buy milk", &ctx()).expect("parse");
            assert!(task.completed);
            assert_eq!(task.content, "Buy milk");
            assert_eq!(task.priority, None);
            assert_eq!(task.id, None);
        }

        #[test]
        fn out_of_range_priority_stays_literal() {
            let task = parse_line("- [ ] Fix bug (p5)", &ctx()).expect("parse");
            assert_eq!(task.content, "Fix bug (p5)");
            assert_eq!(task.priority, None);
        }

        #[test]
        fn unparseable_due_keeps_parenthetical() {
            let task = parse_line("- [ ] Call (@someday) now", &ctx()).expect("parse");
            assert_eq!(task.content, "Call (@someday) now");
            assert!(task.due.is_none());
        }

        #[test]
        fn unrelated_parentheses_are_content() {
            let task = parse_line("- [ ] Call (mom) later", &ctx()).expect("parse");
            assert_eq!(task.content, "Call (mom) later");
        }

        #[test]
        fn hash_without_letter_is_literal() {
            let task = parse_line("- [ ] Ticket #42 and #ops", &ctx()).expect("parse");
            assert_eq!(task.content, "Ticket #42 and");
            assert_eq!(task.labels, vec!["ops".to_string()]);
        }

        #[test]
        fn labels_keep_document_order() {
            let task = parse_line("- [ ] Plan #b #a", &ctx()).expect("parse");
            assert_eq!(task.labels, vec!["b".to_string(), "a".to_string()]);
        }

        #[test]
        fn non_task_lines_are_rejected() {
            assert!(parse_line("Just prose", &ctx()).is_none());
            assert!(parse_line("- plain bullet", &ctx()).is_none());
            assert!(parse_line("- [ ]", &ctx()).is_none());
            assert!(parse_line("- [ ] ", &ctx()).is_none());
            assert!(parse_line("- [?] odd", &ctx()).is_none());
            assert!(parse_line("", &ctx()).is_none());
        }

        #[test]
        fn color_spans_are_stripped() {
            let task = parse_line(
                "- [ ] <span style=\"color: #fad000\">Pay rent</span> <span style=\"color: #6ffc97\">(@today)</span> <!--77-->",
                &ctx(),
            )
            .expect("parse");
            assert_eq!(task.content, "Pay rent");
            assert_eq!(task.due.expect("due").date, day(2024, 3, 13));
            assert_eq!(task.id, Some(TaskId::from("77")));
        }

        #[test]
        fn stray_angle_brackets_survive() {
            assert_eq!(strip_tags("a < b > c"), "a < b > c");
            assert_eq!(strip_tags("x </i> y"), "x </i> y");
            assert_eq!(strip_tags("<b>bold</b> <br/>"), "bold ");
            assert_eq!(strip_tags("open <span"), "open <span");
        }

        #[test]
        fn malformed_id_comment_stays_text() {
            let (body, id) = extract_id("- [ ] see <!--abc--> and <!--9-->");
            assert_eq!(body, "- [ ] see <!--abc--> and ");
            assert_eq!(id, Some(TaskId::from("9")));
        }

        #[test]
        fn relative_due_expressions() {
            let today = day(2024, 3, 13);
            let resolve = |e: &str| resolve_due_expression(e, today).map(|d| d.date);
            assert_eq!(resolve("today"), Some(today));
            assert_eq!(resolve("next week"), Some(day(2024, 3, 20)));
            assert_eq!(resolve("Friday"), Some(day(2024, 3, 15)));
            assert_eq!(resolve("monday"), Some(day(2024, 3, 18)));
            assert_eq!(resolve("wednesday"), Some(today));
            assert_eq!(resolve("next wednesday"), Some(day(2024, 3, 20)));
            assert_eq!(resolve("2024-12-01"), Some(day(2024, 12, 1)));
            assert_eq!(resolve("2024/2/9"), Some(day(2024, 2, 9)));
            assert_eq!(resolve("2024-02-30"), None);
            assert_eq!(resolve("soon"), None);
        }

        #[test]
        fn humanized_due_string() {
            let due = resolve_due_expression("2024-01-05", day(2024, 1, 1)).expect("date");
            assert_eq!(due.humanized, "Jan 05");
        }

        #[test]
        fn segmenter_attaches_descriptions() {
            let text = "# Header\n- [ ] One\n\t`first`\n    second\nprose\n- [ ] Two\n";
            let lines = split_lines(text);
            let body = segment(&lines, &ctx());
            assert_eq!(body.len(), 4);
            assert_eq!(body[0], Fragment::Opaque("# Header\n".into()));
            assert_eq!(
                body[1].as_task().map(|t| t.description.as_str()),
                Some("first\nsecond")
            );
            assert_eq!(body[2], Fragment::Opaque("prose\n".into()));
            assert_eq!(body[3].as_task().map(|t| t.content.as_str()), Some("Two"));
        }

        #[test]
        fn indented_line_without_task_is_opaque() {
            let lines = split_lines("\tcode\n");
            assert_eq!(segment(&lines, &ctx()), vec![Fragment::Opaque("\tcode\n".into())]);
        }

        #[test]
        fn rejected_tasks_become_opaque() {
            let lines = split_lines("- [ ] mine <!--1-->\n- [ ] other <!--2-->\n");
            let body = segment_with(&lines, &ctx(), |t| t.id == Some(TaskId::from("1")));
            assert!(body[0].is_task());
            assert_eq!(body[1], Fragment::Opaque("- [ ] other <!--2-->\n".into()));
        }

        #[test]
        fn segment_carries_context() {
            let project = ProjectId::from("5");
            let c = ctx().with_project(&project).with_mtime(42);
            let lines = split_lines("- [ ] task\r\n");
            let body = segment(&lines, &c);
            let task = body[0].as_task().expect("task");
            assert_eq!(task.project_id, Some(project.clone()));
            assert_eq!(task.mtime, 42);
            assert_eq!(task.content, "task");
        }

        #[test]
        fn capture_lines() {
            let c = ctx();
            assert!(matches!(
                parse_capture_line("- Buy bread (p1)", &c),
                Some(CaptureLine::Task(t)) if t.content == "Buy bread" && !t.completed
            ));
            assert!(matches!(
                parse_capture_line("- [x] Done already", &c),
                Some(CaptureLine::Task(t)) if t.completed
            ));
            assert_eq!(
                parse_capture_line("@Home", &c),
                Some(CaptureLine::Project("Home".into()))
            );
            assert_eq!(
                parse_capture_line(":notes here", &c),
                Some(CaptureLine::Description("notes here".into()))
            );
            assert_eq!(
                parse_capture_line("today & #work", &c),
                Some(CaptureLine::Filter("today & #work".into()))
            );
            assert_eq!(parse_capture_line("   ", &c), None);
        }

        #[test]
        fn capture_blocks_are_located() {
            let lines = split_lines("intro\n```todomd\n- a\n```\nmid\n```todomd\n- b\n");
            let blocks = find_capture_blocks(&lines);
            assert_eq!(blocks.len(), 2);
            assert_eq!((blocks[0].start, blocks[0].end), (1, 3));
            assert_eq!(blocks[0].lines, vec!["- a".to_string()]);
            assert_eq!((blocks[1].start, blocks[1].end), (5, 6));
        }
    }
}

pub mod ids {
    //! Temporary-to-permanent id resolution, consulted by every component that
    //! compares or renders ids after a command flush.

    use crate::core::{ProjectId, TaskId};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default)]
    pub struct IdResolver {
        mapping: HashMap<String, String>,
    }

    impl IdResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record(&mut self, temporary: impl Into<String>, permanent: impl Into<String>) {
            self.mapping.insert(temporary.into(), permanent.into());
        }

        pub fn extend(&mut self, mapping: HashMap<String, String>) {
            self.mapping.extend(mapping);
        }

        /// The permanent id for `id`, or `id` itself when nothing was assigned.
        pub fn task(&self, id: &TaskId) -> TaskId {
            match self.mapping.get(id.as_str()) {
                Some(permanent) => TaskId(permanent.clone()),
                None => id.clone(),
            }
        }

        pub fn project(&self, id: &ProjectId) -> ProjectId {
            match self.mapping.get(id.as_str()) {
                Some(permanent) => ProjectId(permanent.clone()),
                None => id.clone(),
            }
        }

        pub fn len(&self) -> usize {
            self.mapping.len()
        }

        pub fn is_empty(&self) -> bool {
            self.mapping.is_empty()
        }

        pub fn clear(&mut self) {
            self.mapping.clear();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn unmapped_ids_pass_through() {
            let mut resolver = IdResolver::new();
            resolver.record("tmp-1", "501");
            assert_eq!(resolver.task(&TaskId::from("tmp-1")), TaskId::from("501"));
            assert_eq!(resolver.task(&TaskId::from("77")), TaskId::from("77"));
            assert_eq!(
                resolver.project(&ProjectId::from("tmp-1")),
                ProjectId::from("501")
            );
            resolver.clear();
            assert!(resolver.is_empty());
        }
    }
}

pub mod remote {
    //! Remote task service interface and the command model sent to it.

    use crate::core::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use uuid::Uuid;

    /* ------------------------------ Commands ------------------------------ */

    /// One queued remote mutation. `uuid` is the idempotency key.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct Command {
        pub uuid: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temp_id: Option<String>,
        #[serde(flatten)]
        pub op: Operation,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "type", content = "args", rename_all = "snake_case")]
    pub enum Operation {
        ProjectAdd(ProjectAddArgs),
        ProjectUpdate(ProjectUpdateArgs),
        ProjectDelete(ProjectRef),
        ItemAdd(ItemAddArgs),
        ItemUpdate(ItemUpdateArgs),
        ItemDelete(TaskRef),
        ItemComplete(TaskRef),
        ItemUncomplete(TaskRef),
    }

    impl Operation {
        pub fn kind(&self) -> &'static str {
            match self {
                Operation::ProjectAdd(_) => "project_add",
                Operation::ProjectUpdate(_) => "project_update",
                Operation::ProjectDelete(_) => "project_delete",
                Operation::ItemAdd(_) => "item_add",
                Operation::ItemUpdate(_) => "item_update",
                Operation::ItemDelete(_) => "item_delete",
                Operation::ItemComplete(_) => "item_complete",
                Operation::ItemUncomplete(_) => "item_uncomplete",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ProjectAddArgs {
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ProjectUpdateArgs {
        pub id: ProjectId,
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ProjectRef {
        pub id: ProjectId,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct TaskRef {
        pub id: TaskId,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ItemAddArgs {
        pub content: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub project_id: Option<ProjectId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub due: Option<DueDate>,
        pub priority: Priority,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub labels: Vec<String>,
    }

    impl From<&Task> for ItemAddArgs {
        fn from(task: &Task) -> Self {
            Self {
                content: task.content.clone(),
                description: task.description.clone(),
                project_id: task.project_id.clone(),
                due: task.due.clone(),
                priority: task.priority_or_default(),
                labels: task.labels.clone(),
            }
        }
    }

    /// Field-level update; `None` means "unchanged". `due: Some(None)` clears the date.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ItemUpdateArgs {
        pub id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "::serde_with::rust::double_option"
        )]
        pub due: Option<Option<DueDate>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub priority: Option<Priority>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub labels: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
    }

    impl ItemUpdateArgs {
        /// Fields of `local` that differ from `remote`. Due dates compare by day,
        /// labels as a multiset, descriptions in normalized form.
        pub fn between(id: &TaskId, remote: &Task, local: &Task) -> Self {
            Self {
                id: id.clone(),
                content: (remote.content != local.content).then(|| local.content.clone()),
                due: (!due_dates_match(remote.due.as_ref(), local.due.as_ref()))
                    .then(|| local.due.clone()),
                priority: if remote.priority != local.priority {
                    local.priority
                } else {
                    None
                },
                labels: (!remote.labels_match(local)).then(|| local.labels.clone()),
                description: (normalize_description(&remote.description)
                    != normalize_description(&local.description))
                .then(|| local.description.clone()),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.content.is_none()
                && self.due.is_none()
                && self.priority.is_none()
                && self.labels.is_none()
                && self.description.is_none()
        }

        pub fn apply_to(&self, task: &mut Task) {
            if let Some(content) = &self.content {
                task.content = content.clone();
            }
            if let Some(due) = &self.due {
                task.due = due.clone();
            }
            if let Some(priority) = self.priority {
                task.priority = Some(priority);
            }
            if let Some(labels) = &self.labels {
                task.labels = labels.clone();
            }
            if let Some(description) = &self.description {
                task.description = description.clone();
            }
        }
    }

    /// Commands accumulated during one pass, flushed in order.
    #[derive(Debug, Clone, Default)]
    pub struct CommandQueue {
        commands: Vec<Command>,
    }

    impl CommandQueue {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&mut self, temp_id: Option<String>, op: Operation) {
            self.commands.push(Command {
                uuid: Uuid::new_v4(),
                temp_id,
                op,
            });
        }

        pub fn project_add(&mut self, name: &str, temp_id: &ProjectId) {
            self.push(
                Some(temp_id.to_string()),
                Operation::ProjectAdd(ProjectAddArgs {
                    name: name.to_string(),
                }),
            );
        }

        pub fn project_update(&mut self, id: &ProjectId, name: &str) {
            self.push(
                None,
                Operation::ProjectUpdate(ProjectUpdateArgs {
                    id: id.clone(),
                    name: name.to_string(),
                }),
            );
        }

        pub fn project_delete(&mut self, id: &ProjectId) {
            self.push(None, Operation::ProjectDelete(ProjectRef { id: id.clone() }));
        }

        pub fn item_add(&mut self, args: ItemAddArgs, temp_id: &TaskId) {
            self.push(Some(temp_id.to_string()), Operation::ItemAdd(args));
        }

        pub fn item_update(&mut self, args: ItemUpdateArgs) {
            self.push(None, Operation::ItemUpdate(args));
        }

        pub fn item_delete(&mut self, id: &TaskId) {
            self.push(None, Operation::ItemDelete(TaskRef { id: id.clone() }));
        }

        pub fn item_complete(&mut self, id: &TaskId) {
            self.push(None, Operation::ItemComplete(TaskRef { id: id.clone() }));
        }

        pub fn item_uncomplete(&mut self, id: &TaskId) {
            self.push(None, Operation::ItemUncomplete(TaskRef { id: id.clone() }));
        }

        pub fn len(&self) -> usize {
            self.commands.len()
        }

        pub fn is_empty(&self) -> bool {
            self.commands.is_empty()
        }

        pub fn as_slice(&self) -> &[Command] {
            &self.commands
        }

        pub fn chunks(&self, size: usize) -> std::slice::Chunks<'_, Command> {
            self.commands.chunks(size.max(1))
        }
    }

    /* ------------------------------ Service ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RemoteProject {
        pub id: ProjectId,
        pub name: String,
        #[serde(default)]
        pub is_inbox: bool,
    }

    /// Response of a snapshot fetch. Incremental responses carry removals.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SnapshotPayload {
        #[serde(default)]
        pub projects: Vec<RemoteProject>,
        #[serde(default)]
        pub tasks: Vec<Task>,
        pub cursor: String,
        #[serde(default)]
        pub temp_id_map: HashMap<String, String>,
        #[serde(default = "SnapshotPayload::default_full_sync")]
        pub full_sync: bool,
        #[serde(default)]
        pub removed_tasks: Vec<TaskId>,
        #[serde(default)]
        pub removed_projects: Vec<ProjectId>,
    }

    impl SnapshotPayload {
        fn default_full_sync() -> bool {
            true
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum RemoteError {
        #[error("invalid or missing API credential: {0}")]
        Auth(String),
        #[error("remote request failed: {detail}")]
        Transport { status: Option<u16>, detail: String },
        #[error("malformed remote response: {0}")]
        Parse(String),
    }

    /// The remote task service. Transport, authentication and retries live behind it.
    #[async_trait(?Send)]
    pub trait RemoteService {
        async fn health_check(&self) -> Result<(), RemoteError>;

        /// Full pull when `cursor` is `None`, incremental otherwise (the response says which).
        async fn fetch_snapshot(&self, cursor: Option<&str>) -> Result<SnapshotPayload, RemoteError>;

        async fn fetch_completed(&self) -> Result<Vec<Task>, RemoteError>;

        /// Applies a batch of commands; returns the temp id -> permanent id map.
        async fn submit_commands(
            &self,
            commands: &[Command],
        ) -> Result<HashMap<String, String>, RemoteError>;

        async fn query_by_filter(&self, expression: &str) -> Result<Vec<Task>, RemoteError>;
    }

}

pub mod state {
    //! Persisted sync state and user settings.

    use crate::core::*;
    use crate::remote::{RemoteProject, SnapshotPayload};
    use crate::storage::StorageError;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;

    /* ------------------------------ Settings ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SortPolicy {
        #[default]
        None,
        Priority,
        DueAscending,
        DueDescending,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DueColors {
        pub past: String,
        pub today: String,
        pub tomorrow: String,
        pub within_week: String,
        pub future: String,
    }

    impl Default for DueColors {
        fn default() -> Self {
            Self {
                past: "#f7b0ab".into(),
                today: "#6ffc97".into(),
                tomorrow: "#74e8f7".into(),
                within_week: "#a68eed".into(),
                future: "#bdffcc".into(),
            }
        }
    }

    /// Display settings. The persisted copy doubles as the fingerprint that forces a
    /// full re-render when it differs from the current one.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct EditorSettings {
        pub show_description: bool,
        pub show_task_color: bool,
        pub show_due_color: bool,
        pub relative_dates: bool,
        pub sort: SortPolicy,
        pub todos_on_top: bool,
        /// Keyed by the `(pN)` token digit.
        pub priority_colors: BTreeMap<u8, String>,
        pub due_colors: DueColors,
    }

    impl Default for EditorSettings {
        fn default() -> Self {
            let priority_colors = [(1, "#9b6feb"), (2, "#fad000"), (3, "#14aaf5"), (4, "#ffffff")]
                .into_iter()
                .map(|(digit, color)| (digit, color.to_string()))
                .collect();
            Self {
                show_description: true,
                show_task_color: true,
                show_due_color: true,
                relative_dates: true,
                sort: SortPolicy::None,
                todos_on_top: false,
                priority_colors,
                due_colors: DueColors::default(),
            }
        }
    }

    impl EditorSettings {
        /// No markup at all; handy for plain-text tooling.
        pub fn plain() -> Self {
            Self {
                show_task_color: false,
                show_due_color: false,
                ..Self::default()
            }
        }

        pub fn priority_color(&self, priority: Priority) -> Option<&str> {
            self.priority_colors
                .get(&priority.token_digit())
                .map(String::as_str)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Managed directory holding one document per project, relative to the vault.
        pub directory: String,
        pub extension: String,
        /// Maximum commands per remote round-trip.
        pub chunk_size: usize,
        pub editor: EditorSettings,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                directory: "todos".into(),
                extension: "md".into(),
                chunk_size: 100,
                editor: EditorSettings::default(),
            }
        }
    }

    impl Settings {
        /// Reads settings JSON; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self, StorageError> {
            if !path.exists() {
                return Ok(Self::default());
            }
            let text = std::fs::read_to_string(path).map_err(|source| StorageError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Ok(serde_json::from_str(&text)?)
        }

        pub fn directory(&self) -> DocPath {
            DocPath::new(&self.directory)
        }
    }

    /* ------------------------------ Snapshot ------------------------------ */

    /// Last-known remote state.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct RemoteSnapshot {
        #[serde(default)]
        pub tasks: IndexMap<TaskId, Task>,
        #[serde(default)]
        pub projects: IndexMap<ProjectId, RemoteProject>,
        #[serde(default)]
        pub inbox_id: Option<ProjectId>,
        #[serde(default)]
        pub cursor: Option<String>,
    }

    impl RemoteSnapshot {
        pub fn is_pulled(&self) -> bool {
            self.cursor.is_some()
        }

        pub fn task(&self, id: &TaskId) -> Option<&Task> {
            self.tasks.get(id)
        }

        pub fn project(&self, id: &ProjectId) -> Option<&RemoteProject> {
            self.projects.get(id)
        }

        pub fn apply(&mut self, payload: SnapshotPayload) {
            if payload.full_sync {
                self.tasks.clear();
                self.projects.clear();
                self.inbox_id = None;
            }
            for id in &payload.removed_tasks {
                self.tasks.shift_remove(id);
            }
            for id in &payload.removed_projects {
                self.projects.shift_remove(id);
            }
            for project in payload.projects {
                if project.is_inbox {
                    self.inbox_id = Some(project.id.clone());
                }
                self.projects.insert(project.id.clone(), project);
            }
            for task in payload.tasks {
                if let Some(id) = task.id.clone() {
                    self.tasks.insert(id, task);
                }
            }
            self.cursor = Some(payload.cursor);
        }

        /// Adds cached completed tasks the active snapshot does not already carry.
        pub fn merge_completed(&mut self, completed: &BTreeMap<TaskId, Task>) {
            for (id, task) in completed {
                if !self.tasks.contains_key(id) {
                    let mut task = task.clone();
                    task.completed = true;
                    self.tasks.insert(id.clone(), task);
                }
            }
        }

        /// Exact name match first, then the first case-insensitive substring match.
        pub fn find_project(&self, name: &str) -> Option<&RemoteProject> {
            self.projects.values().find(|p| p.name == name).or_else(|| {
                let needle = name.to_lowercase();
                self.projects
                    .values()
                    .find(|p| p.name.to_lowercase().contains(&needle))
            })
        }
    }

    /* ------------------------------ Sync state ------------------------------ */

    /// Everything carried from one pass to the next.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct SyncState {
        #[serde(default)]
        pub snapshot: RemoteSnapshot,
        /// Documents holding captured tasks, with the task ids each one is known to contain.
        #[serde(default)]
        pub registered_files: BTreeMap<DocPath, BTreeSet<TaskId>>,
        #[serde(default)]
        pub priority_memo: BTreeMap<TaskId, Priority>,
        #[serde(default)]
        pub completed: BTreeMap<TaskId, Task>,
        #[serde(default)]
        pub editor_fingerprint: Option<EditorSettings>,
        #[serde(default)]
        pub previous_projects: BTreeMap<ProjectId, Vec<TaskId>>,
        #[serde(default)]
        pub file_mtimes: BTreeMap<DocPath, i64>,
    }

    impl SyncState {
        /// True when the display settings differ from the ones last rendered with.
        pub fn settings_changed(&self, current: &EditorSettings) -> bool {
            self.editor_fingerprint.as_ref() != Some(current)
        }

        pub fn register_file(&mut self, path: &DocPath, ids: impl IntoIterator<Item = TaskId>) {
            self.registered_files
                .entry(path.clone())
                .or_default()
                .extend(ids);
        }

        pub fn is_registered(&self, id: &TaskId) -> bool {
            self.registered_files.values().any(|ids| ids.contains(id))
        }

        /// Cached completion state wins over a stale active snapshot entry.
        pub fn is_completed_remotely(&self, id: &TaskId) -> bool {
            self.completed.contains_key(id) || self.snapshot.task(id).is_some_and(|t| t.completed)
        }
    }

}

pub mod format {
    //! Task line rendering, sort policies and body emission.

    use crate::core::*;
    use crate::ids::IdResolver;
    use crate::state::{DueColors, EditorSettings, RemoteSnapshot, SortPolicy};
    use chrono::NaiveDate;
    use std::cmp::Ordering;

    /// What the renderer consults besides the body itself.
    #[derive(Debug, Clone, Copy)]
    pub struct RenderContext<'a> {
        pub settings: &'a EditorSettings,
        pub today: NaiveDate,
        pub resolver: Option<&'a IdResolver>,
        pub snapshot: Option<&'a RemoteSnapshot>,
        /// The body's completion state wins over the snapshot's.
        pub keep_local_completion: bool,
    }

    impl<'a> RenderContext<'a> {
        pub fn new(settings: &'a EditorSettings, today: NaiveDate) -> Self {
            Self {
                settings,
                today,
                resolver: None,
                snapshot: None,
                keep_local_completion: false,
            }
        }

        pub fn with_resolver(mut self, resolver: &'a IdResolver) -> Self {
            self.resolver = Some(resolver);
            self
        }

        pub fn with_snapshot(mut self, snapshot: &'a RemoteSnapshot) -> Self {
            self.snapshot = Some(snapshot);
            self
        }

        pub fn keeping_local_completion(mut self) -> Self {
            self.keep_local_completion = true;
            self
        }
    }

    pub fn format_body(body: &[Fragment], ctx: &RenderContext<'_>) -> String {
        emit_body(&arrange_body(body, ctx), ctx)
    }

    /// Resolves every task and applies the sort policy; the result is what gets written.
    pub fn arrange_body(body: &[Fragment], ctx: &RenderContext<'_>) -> Body {
        let mut arranged: Body = body
            .iter()
            .map(|fragment| match fragment {
                Fragment::Task(task) => Fragment::Task(resolve_task(task, ctx)),
                Fragment::Opaque(text) => Fragment::Opaque(text.clone()),
            })
            .collect();
        sort_body(&mut arranged, ctx.settings.sort);
        if ctx.settings.todos_on_top {
            move_tasks_to_top(&mut arranged);
        }
        arranged
    }

    /// Maps the id through the resolver, then takes the snapshot values when known.
    pub fn resolve_task(task: &Task, ctx: &RenderContext<'_>) -> Task {
        let Some(id) = &task.id else {
            return task.clone();
        };
        let id = match ctx.resolver {
            Some(resolver) => resolver.task(id),
            None => id.clone(),
        };
        let known = ctx.snapshot.and_then(|snapshot| snapshot.task(&id));

        let mut resolved = known.cloned().unwrap_or_else(|| task.clone());
        resolved.id = Some(id);
        resolved.mtime = task.mtime;
        if ctx.keep_local_completion {
            resolved.completed = task.completed;
        }
        if resolved.project_id.is_none() {
            resolved.project_id = task.project_id.clone();
        }
        resolved
    }

    pub fn emit_body(body: &[Fragment], ctx: &RenderContext<'_>) -> String {
        let mut out = String::new();
        for fragment in body {
            match fragment {
                Fragment::Opaque(text) => out.push_str(text),
                Fragment::Task(task) => {
                    out.push_str(&render_task(task, ctx));
                    out.push('\n');
                }
            }
        }
        out.truncate(out.trim_end().len());
        out
    }

    /* ------------------------------ Task lines ------------------------------ */

    /// `- [x] content (pN) (@due) #a #b <!--id-->` plus fenced description lines.
    pub fn render_task(task: &Task, ctx: &RenderContext<'_>) -> String {
        let settings = ctx.settings;
        let priority = task.priority_or_default();
        let mut parts = Vec::new();

        match settings
            .show_task_color
            .then(|| settings.priority_color(priority))
            .flatten()
        {
            Some(color) => parts.push(format!(
                "<span style=\"color: {color}\">{}</span>",
                task.content
            )),
            None => parts.push(task.content.clone()),
        }
        if !priority.is_default() {
            parts.push(format!("(p{})", priority.token_digit()));
        }
        if let Some(due) = &task.due {
            parts.push(render_due(due, ctx));
        }
        parts.extend(task.labels.iter().map(|label| format!("#{label}")));
        if let Some(id) = task.id.as_ref().filter(|id| !id.is_temporary()) {
            parts.push(format!("<!--{id}-->"));
        }

        let mut out = format!(
            "- [{}] {}",
            if task.completed { 'x' } else { ' ' },
            parts.join(" ")
        );
        if settings.show_description {
            for line in task.description.lines().map(str::trim).filter(|l| !l.is_empty()) {
                out.push_str("\n\t`");
                out.push_str(line);
                out.push('`');
            }
        }
        out
    }

    pub fn render_due(due: &DueDate, ctx: &RenderContext<'_>) -> String {
        let label = if ctx.settings.relative_dates {
            relative_label(due.date, ctx.today)
        } else {
            iso(due.date)
        };
        let token = format!("(@{label})");
        if ctx.settings.show_due_color {
            let color = due_color(&ctx.settings.due_colors, due_bucket(due.date, ctx.today));
            format!("<span style=\"color: {color}\">{token}</span>")
        } else {
            token
        }
    }

    /// `today`, `tomorrow`, a weekday name within the week, ISO date otherwise.
    pub fn relative_label(date: NaiveDate, today: NaiveDate) -> String {
        match (date - today).num_days() {
            0 => "today".to_string(),
            1 => "tomorrow".to_string(),
            2..=6 => date.format("%A").to_string().to_lowercase(),
            _ => iso(date),
        }
    }

    fn iso(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DueBucket {
        Past,
        Today,
        Tomorrow,
        WithinWeek,
        Future,
    }

    pub fn due_bucket(date: NaiveDate, today: NaiveDate) -> DueBucket {
        match (date - today).num_days() {
            d if d < 0 => DueBucket::Past,
            0 => DueBucket::Today,
            1 => DueBucket::Tomorrow,
            2..=7 => DueBucket::WithinWeek,
            _ => DueBucket::Future,
        }
    }

    fn due_color(colors: &DueColors, bucket: DueBucket) -> &str {
        match bucket {
            DueBucket::Past => &colors.past,
            DueBucket::Today => &colors.today,
            DueBucket::Tomorrow => &colors.tomorrow,
            DueBucket::WithinWeek => &colors.within_week,
            DueBucket::Future => &colors.future,
        }
    }

    /* -------------------------------- Sorting -------------------------------- */

    /// Completed tasks always go after open ones; then the policy decides.
    pub fn compare_tasks(a: &Task, b: &Task, policy: SortPolicy) -> Ordering {
        a.completed.cmp(&b.completed).then_with(|| match policy {
            SortPolicy::None => Ordering::Equal,
            SortPolicy::Priority => b.priority_or_default().cmp(&a.priority_or_default()),
            SortPolicy::DueAscending | SortPolicy::DueDescending => {
                let descending = policy == SortPolicy::DueDescending;
                compare_due(a, b, descending)
                    .then_with(|| a.content.chars().count().cmp(&b.content.chars().count()))
                    .then_with(|| b.priority_or_default().cmp(&a.priority_or_default()))
            }
        })
    }

    /// Missing dates sort last in both directions.
    fn compare_due(a: &Task, b: &Task, descending: bool) -> Ordering {
        match (&a.due, &b.due) {
            (Some(x), Some(y)) if descending => y.date.cmp(&x.date),
            (Some(x), Some(y)) => x.date.cmp(&y.date),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Stable sort of every contiguous run of tasks; opaque text never moves.
    pub fn sort_body(body: &mut [Fragment], policy: SortPolicy) {
        if policy == SortPolicy::None {
            return;
        }
        let mut start = 0;
        while start < body.len() {
            if !body[start].is_task() {
                start += 1;
                continue;
            }
            let end = body[start..]
                .iter()
                .position(|f| !f.is_task())
                .map_or(body.len(), |offset| start + offset);
            body[start..end].sort_by(|a, b| match (a.as_task(), b.as_task()) {
                (Some(a), Some(b)) => compare_tasks(a, b, policy),
                _ => Ordering::Equal,
            });
            start = end;
        }
    }

    pub fn move_tasks_to_top(body: &mut Body) {
        let (tasks, opaque): (Vec<_>, Vec<_>) = std::mem::take(body).into_iter().partition(Fragment::is_task);
        body.extend(tasks);
        body.extend(opaque);
    }

    pub fn is_sorted(body: &[Fragment], policy: SortPolicy) -> bool {
        if policy == SortPolicy::None {
            return true;
        }
        body.windows(2).all(|pair| match (pair[0].as_task(), pair[1].as_task()) {
            (Some(a), Some(b)) => compare_tasks(a, b, policy) != Ordering::Greater,
            _ => true,
        })
    }

    /// True when rendering under `settings` would move content around.
    pub fn needs_reorder(body: &[Fragment], settings: &EditorSettings) -> bool {
        if settings.todos_on_top {
            if let Some(first_opaque) = body.iter().position(|f| !f.is_task()) {
                if body[first_opaque..].iter().any(Fragment::is_task) {
                    return true;
                }
            }
        }
        !is_sorted(body, settings.sort)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{self, LineContext};

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 13).unwrap()
        }

        fn task(content: &str, priority: u8) -> Task {
            let mut t = Task::new(content);
            t.priority = Some(Priority::new(priority).unwrap());
            t
        }

        fn contents(body: &[Fragment]) -> Vec<String> {
            body.iter()
                .map(|f| match f {
                    Fragment::Task(t) => t.content.clone(),
                    Fragment::Opaque(s) => s.trim().to_string(),
                })
                .collect()
        }

        #[test]
        fn rendered_line_parses_back_to_the_same_task() {
            let settings = EditorSettings::default();
            let ctx = RenderContext::new(&settings, today());
            let mut original = task("Write report", 3);
            original.id = Some(TaskId::from("123"));
            original.due = Some(DueDate::on(today() + chrono::Duration::days(3)));
            original.labels = vec!["work".into(), "home".into()];
            original.description = "first line\nsecond line".into();
            original.completed = true;

            let text = render_task(&original, &ctx);
            let lines = parser::split_lines(&text);
            let body = parser::segment(&lines, &LineContext::new(today()));
            assert_eq!(body, vec![Fragment::Task(original)]);
        }

        #[test]
        fn default_priority_has_no_token() {
            let settings = EditorSettings::plain();
            let ctx = RenderContext::new(&settings, today());
            let line = render_task(&task("Plain", 1), &ctx);
            assert_eq!(line, "- [ ] Plain");
            let parsed = parser::parse_line(&line, &LineContext::new(today())).unwrap();
            assert_eq!(parsed.priority_or_default(), Priority::DEFAULT);
        }

        #[test]
        fn colors_wrap_content_and_due() {
            let settings = EditorSettings::default();
            let ctx = RenderContext::new(&settings, today());
            let mut t = task("Pay rent", 3);
            t.due = Some(DueDate::on(today() - chrono::Duration::days(2)));
            assert_eq!(
                render_task(&t, &ctx),
                "- [ ] <span style=\"color: #fad000\">Pay rent</span> (p2) <span style=\"color: #f7b0ab\">(@2024-03-11)</span>"
            );
        }

        #[test]
        fn relative_labels_and_buckets() {
            let d = |n| today() + chrono::Duration::days(n);
            assert_eq!(relative_label(d(0), today()), "today");
            assert_eq!(relative_label(d(1), today()), "tomorrow");
            assert_eq!(relative_label(d(2), today()), "friday");
            assert_eq!(relative_label(d(7), today()), "2024-03-20");
            assert_eq!(relative_label(d(-1), today()), "2024-03-12");
            assert_eq!(due_bucket(d(7), today()), DueBucket::WithinWeek);
            assert_eq!(due_bucket(d(8), today()), DueBucket::Future);
        }

        #[test]
        fn temporary_ids_resolve_or_disappear() {
            let settings = EditorSettings::plain();
            let mut resolver = IdResolver::new();
            resolver.record("tmp-1", "900");
            let ctx = RenderContext::new(&settings, today()).with_resolver(&resolver);

            let mut mapped = task("Mapped", 1);
            mapped.id = Some(TaskId::from("tmp-1"));
            let mut unmapped = task("Pending", 1);
            unmapped.id = Some(TaskId::from("tmp-2"));
            let body = vec![Fragment::Task(mapped), Fragment::Task(unmapped)];
            assert_eq!(
                format_body(&body, &ctx),
                "- [ ] Mapped <!--900-->\n- [ ] Pending"
            );
        }

        #[test]
        fn snapshot_values_win() {
            let settings = EditorSettings::plain();
            let mut snapshot = RemoteSnapshot::default();
            let mut remote = task("Remote title", 2);
            remote.id = Some(TaskId::from("5"));
            snapshot.tasks.insert(TaskId::from("5"), remote);
            let mut local = task("Local title", 1);
            local.id = Some(TaskId::from("5"));
            let body = vec![Fragment::Task(local)];

            let ctx = RenderContext::new(&settings, today()).with_snapshot(&snapshot);
            assert_eq!(format_body(&body, &ctx), "- [ ] Remote title (p3) <!--5-->");
        }

        #[test]
        fn local_completion_can_outlive_snapshot_values() {
            let settings = EditorSettings::plain();
            let mut snapshot = RemoteSnapshot::default();
            let mut remote = task("Water", 1);
            remote.id = Some(TaskId::from("5"));
            snapshot.tasks.insert(TaskId::from("5"), remote.clone());
            let mut local = remote;
            local.completed = true;
            let body = vec![Fragment::Task(local)];

            let ctx = RenderContext::new(&settings, today()).with_snapshot(&snapshot);
            assert_eq!(format_body(&body, &ctx), "- [ ] Water <!--5-->");
            let ctx = ctx.keeping_local_completion();
            assert_eq!(format_body(&body, &ctx), "- [x] Water <!--5-->");
        }

        #[test]
        fn priority_sort_stays_inside_task_runs() {
            let mut done = task("done", 4);
            done.completed = true;
            let mut body = vec![
                Fragment::Task(task("low", 1)),
                Fragment::Task(done),
                Fragment::Task(task("high", 4)),
                Fragment::Opaque("## later\n".into()),
                Fragment::Task(task("mid", 2)),
                Fragment::Task(task("top", 3)),
            ];
            assert!(!is_sorted(&body, SortPolicy::Priority));
            sort_body(&mut body, SortPolicy::Priority);
            assert_eq!(contents(&body), vec!["high", "low", "done", "## later", "top", "mid"]);
            assert!(is_sorted(&body, SortPolicy::Priority));
        }

        #[test]
        fn due_sort_puts_missing_dates_last() {
            let dated = |name: &str, days: i64| {
                let mut t = task(name, 1);
                t.due = Some(DueDate::on(today() + chrono::Duration::days(days)));
                t
            };
            let mut body = vec![
                Fragment::Task(task("none", 4)),
                Fragment::Task(dated("later", 5)),
                Fragment::Task(dated("soon", 1)),
                Fragment::Task(dated("s", 1)),
            ];
            sort_body(&mut body, SortPolicy::DueAscending);
            assert_eq!(contents(&body), vec!["s", "soon", "later", "none"]);
            sort_body(&mut body, SortPolicy::DueDescending);
            assert_eq!(contents(&body), vec!["later", "s", "soon", "none"]);
        }

        #[test]
        fn todos_on_top_moves_tasks_before_text() {
            let mut settings = EditorSettings::plain();
            settings.todos_on_top = true;
            let body = vec![
                Fragment::Opaque("# Notes\n".into()),
                Fragment::Task(task("a", 1)),
            ];
            assert!(needs_reorder(&body, &settings));
            let ctx = RenderContext::new(&settings, today());
            assert_eq!(format_body(&body, &ctx), "- [ ] a\n# Notes");
        }

        #[test]
        fn opaque_text_is_verbatim_and_tail_trimmed() {
            let settings = EditorSettings::plain();
            let ctx = RenderContext::new(&settings, today());
            let body = vec![
                Fragment::Opaque("  indented  \n```\ncode\n```\n".into()),
                Fragment::Task(task("x", 1)),
                Fragment::Opaque("\n\n".into()),
            ];
            assert_eq!(format_body(&body, &ctx), "  indented  \n```\ncode\n```\n- [ ] x");
        }
    }
}

pub mod storage {
    //! Document and state persistence.

    use crate::core::DocPath;
    use crate::state::SyncState;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    #[derive(Debug, thiserror::Error)]
    pub enum StorageError {
        #[error("I/O error on {path}: {source}")]
        Io {
            path: String,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid JSON: {0}")]
        Json(#[from] serde_json::Error),
        #[error("document not found: {0}")]
        NotFound(String),
    }

    fn io_error(path: impl std::fmt::Display) -> impl FnOnce(std::io::Error) -> StorageError {
        let path = path.to_string();
        move |source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path)
            } else {
                StorageError::Io { path, source }
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DocumentStat {
        /// Unix seconds.
        pub mtime: i64,
    }

    /// Host document storage, addressed by vault-relative paths.
    #[async_trait(?Send)]
    pub trait DocumentStore {
        async fn read_document(&self, path: &DocPath) -> Result<String, StorageError>;

        /// Writes `text` and stamps the document with `mtime`.
        async fn write_document(
            &self,
            path: &DocPath,
            text: &str,
            mtime: i64,
        ) -> Result<(), StorageError>;

        async fn rename_document(&self, from: &DocPath, to: &DocPath) -> Result<(), StorageError>;

        async fn remove_document(&self, path: &DocPath) -> Result<(), StorageError>;

        /// Every document below `dir`, recursively, in path order.
        async fn list_documents(&self, dir: &DocPath) -> Result<Vec<DocPath>, StorageError>;

        async fn stat_document(&self, path: &DocPath) -> Result<DocumentStat, StorageError>;

        async fn document_exists(&self, path: &DocPath) -> bool;
    }

    /* --------------------------- Filesystem store --------------------------- */

    /// Documents on disk under a vault root.
    #[derive(Debug, Clone)]
    pub struct FsDocumentStore {
        root: PathBuf,
    }

    impl FsDocumentStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn abs_path(&self, path: &DocPath) -> PathBuf {
            path.as_str()
                .split('/')
                .filter(|s| !s.is_empty())
                .fold(self.root.clone(), |acc, segment| acc.join(segment))
        }

        fn relative(&self, abs: &Path) -> Option<DocPath> {
            let rel = abs.strip_prefix(&self.root).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Some(DocPath::new(parts.join("/")))
        }

        async fn ensure_parent(&self, abs: &Path) -> Result<(), StorageError> {
            if let Some(parent) = abs.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_error(parent.display()))?;
            }
            Ok(())
        }
    }

    #[async_trait(?Send)]
    impl DocumentStore for FsDocumentStore {
        async fn read_document(&self, path: &DocPath) -> Result<String, StorageError> {
            tokio::fs::read_to_string(self.abs_path(path))
                .await
                .map_err(io_error(path))
        }

        async fn write_document(
            &self,
            path: &DocPath,
            text: &str,
            mtime: i64,
        ) -> Result<(), StorageError> {
            let abs = self.abs_path(path);
            self.ensure_parent(&abs).await?;
            tokio::fs::write(&abs, text).await.map_err(io_error(path))?;

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&abs)
                .await
                .map_err(io_error(path))?
                .into_std()
                .await;
            let stamp = UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
            file.set_modified(stamp).map_err(io_error(path))
        }

        async fn rename_document(&self, from: &DocPath, to: &DocPath) -> Result<(), StorageError> {
            let target = self.abs_path(to);
            self.ensure_parent(&target).await?;
            tokio::fs::rename(self.abs_path(from), target)
                .await
                .map_err(io_error(from))
        }

        async fn remove_document(&self, path: &DocPath) -> Result<(), StorageError> {
            tokio::fs::remove_file(self.abs_path(path))
                .await
                .map_err(io_error(path))
        }

        async fn list_documents(&self, dir: &DocPath) -> Result<Vec<DocPath>, StorageError> {
            let start = self.abs_path(dir);
            if !tokio::fs::try_exists(&start).await.unwrap_or(false) {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            let mut pending = vec![start];
            while let Some(current) = pending.pop() {
                let mut entries = tokio::fs::read_dir(&current)
                    .await
                    .map_err(io_error(current.display()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(io_error(current.display()))?
                {
                    let file_type = entry
                        .file_type()
                        .await
                        .map_err(io_error(entry.path().display()))?;
                    // Symlinks are skipped to avoid cycles.
                    if file_type.is_symlink() {
                        continue;
                    }
                    if file_type.is_dir() {
                        pending.push(entry.path());
                    } else if let Some(rel) = self.relative(&entry.path()) {
                        out.push(rel);
                    }
                }
            }
            out.sort();
            Ok(out)
        }

        async fn stat_document(&self, path: &DocPath) -> Result<DocumentStat, StorageError> {
            let meta = tokio::fs::metadata(self.abs_path(path))
                .await
                .map_err(io_error(path))?;
            let modified = meta.modified().map_err(io_error(path))?;
            let mtime = match modified.duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_secs() as i64,
                Err(before) => -(before.duration().as_secs() as i64),
            };
            Ok(DocumentStat { mtime })
        }

        async fn document_exists(&self, path: &DocPath) -> bool {
            tokio::fs::try_exists(self.abs_path(path))
                .await
                .unwrap_or(false)
        }
    }

    /* ----------------------------- Memory store ----------------------------- */

    /// In-process document map, for hosts without a filesystem.
    #[derive(Debug, Default)]
    pub struct MemoryDocumentStore {
        docs: Mutex<BTreeMap<DocPath, (String, i64)>>,
    }

    impl MemoryDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<DocPath, (String, i64)>> {
            self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        pub fn insert(&self, path: &str, text: &str, mtime: i64) {
            self.docs()
                .insert(DocPath::new(path), (text.to_string(), mtime));
        }

        pub fn get(&self, path: &str) -> Option<String> {
            self.docs()
                .get(&DocPath::new(path))
                .map(|(text, _)| text.clone())
        }

        pub fn paths(&self) -> Vec<DocPath> {
            self.docs().keys().cloned().collect()
        }
    }

    #[async_trait(?Send)]
    impl DocumentStore for MemoryDocumentStore {
        async fn read_document(&self, path: &DocPath) -> Result<String, StorageError> {
            self.docs()
                .get(path)
                .map(|(text, _)| text.clone())
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn write_document(
            &self,
            path: &DocPath,
            text: &str,
            mtime: i64,
        ) -> Result<(), StorageError> {
            self.docs().insert(path.clone(), (text.to_string(), mtime));
            Ok(())
        }

        async fn rename_document(&self, from: &DocPath, to: &DocPath) -> Result<(), StorageError> {
            let mut docs = self.docs();
            let doc = docs
                .remove(from)
                .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
            docs.insert(to.clone(), doc);
            Ok(())
        }

        async fn remove_document(&self, path: &DocPath) -> Result<(), StorageError> {
            self.docs()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn list_documents(&self, dir: &DocPath) -> Result<Vec<DocPath>, StorageError> {
            Ok(self
                .docs()
                .keys()
                .filter(|path| path.is_within(dir))
                .cloned()
                .collect())
        }

        async fn stat_document(&self, path: &DocPath) -> Result<DocumentStat, StorageError> {
            self.docs()
                .get(path)
                .map(|(_, mtime)| DocumentStat { mtime: *mtime })
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn document_exists(&self, path: &DocPath) -> bool {
            self.docs().contains_key(path)
        }
    }

    /* ------------------------------ State store ------------------------------ */

    pub trait StateStore {
        fn load(&self) -> Result<SyncState, StorageError>;
        fn save(&self, state: &SyncState) -> Result<(), StorageError>;
    }

    /// Sync state as a JSON file, replaced atomically on save.
    #[derive(Debug, Clone)]
    pub struct JsonStateStore {
        path: PathBuf,
    }

    impl JsonStateStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        fn write_atomic(&self, bytes: &[u8]) -> Result<(), StorageError> {
            let temp_path = self.path.with_extension("tmp");
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(io_error(parent.display()))?;
            }
            {
                let mut file =
                    std::fs::File::create(&temp_path).map_err(io_error(temp_path.display()))?;
                file.write_all(bytes).map_err(io_error(temp_path.display()))?;
                file.sync_all().map_err(io_error(temp_path.display()))?;
            }
            std::fs::rename(&temp_path, &self.path).map_err(io_error(self.path.display()))
        }
    }

    impl StateStore for JsonStateStore {
        fn load(&self) -> Result<SyncState, StorageError> {
            if !self.path.exists() {
                return Ok(SyncState::default());
            }
            let text = std::fs::read_to_string(&self.path).map_err(io_error(self.path.display()))?;
            Ok(serde_json::from_str(&text)?)
        }

        fn save(&self, state: &SyncState) -> Result<(), StorageError> {
            let json = serde_json::to_vec_pretty(state)?;
            self.write_atomic(&json)
        }
    }

    /// Current time in unix seconds, the stamp used for written documents.
    pub fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

}

pub mod reconcile {
    //! Diff engine.
    //!
    //! A pass walks the registered-file ledger, then every project document under the
    //! managed directory, and compares each parsed task with the snapshot:
    //! - pushing queues remote commands for every local difference;
    //! - pulling rewrites the local view to match the snapshot.
    //!
    //! Remote entries no local document mentions are deleted (push) or materialized
    //! at the head of their project's body (pull).

    use crate::core::*;
    use crate::format;
    use crate::naming;
    use crate::parser::{self, LineContext};
    use crate::remote::{CommandQueue, ItemAddArgs, ItemUpdateArgs, RemoteProject};
    use crate::state::{Settings, SyncState};
    use crate::storage::{DocumentStore, StorageError};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiffOptions {
        /// Local changes become remote commands.
        pub is_push: bool,
        /// Local documents may be changed to match the remote.
        pub can_change: bool,
    }

    impl DiffOptions {
        pub const PUSH: Self = Self {
            is_push: true,
            can_change: true,
        };
        pub const SOFT_PULL: Self = Self {
            is_push: false,
            can_change: false,
        };
        pub const FORCED_PULL: Self = Self {
            is_push: false,
            can_change: true,
        };
    }

    #[derive(Debug, Default)]
    pub struct DiffOutcome {
        /// Keyed by project id (temporary for new projects) or `registered:<path>`.
        pub projects: IndexMap<String, Project>,
        pub commands: CommandQueue,
        /// Non-fatal problems to surface to the user.
        pub warnings: Vec<String>,
        /// Orphaned project documents to delete.
        pub removed: Vec<DocPath>,
    }

    impl DiffOutcome {
        pub fn dirty_projects(&self) -> impl Iterator<Item = &Project> {
            self.projects.values().filter(|p| p.has_updates)
        }
    }

    struct Pass {
        projects: IndexMap<String, Project>,
        untouched_projects: IndexMap<ProjectId, RemoteProject>,
        untouched_tasks: IndexMap<TaskId, Task>,
        removed: Vec<DocPath>,
    }

    pub struct Reconciler<'a> {
        state: &'a mut SyncState,
        settings: &'a Settings,
        today: NaiveDate,
        options: DiffOptions,
        /// Display settings changed since the last render: every document is rewritten.
        forced: bool,
        queue: CommandQueue,
        warnings: Vec<String>,
        /// Task copies read from registered documents.
        registered: HashMap<TaskId, Task>,
        /// Projects owning a task that appears in a registered document.
        forced_projects: HashSet<ProjectId>,
    }

    impl<'a> Reconciler<'a> {
        pub fn new(
            state: &'a mut SyncState,
            settings: &'a Settings,
            today: NaiveDate,
            options: DiffOptions,
        ) -> Self {
            let forced = state.settings_changed(&settings.editor);
            Self {
                state,
                settings,
                today,
                options,
                forced,
                queue: CommandQueue::new(),
                warnings: Vec::new(),
                registered: HashMap::new(),
                forced_projects: HashSet::new(),
            }
        }

        pub async fn run<D: DocumentStore>(mut self, docs: &D) -> Result<DiffOutcome, StorageError> {
            info!(
                push = self.options.is_push,
                can_change = self.options.can_change,
                forced = self.forced,
                "computing diff"
            );
            let mut pass = Pass {
                projects: IndexMap::new(),
                untouched_projects: self.state.snapshot.projects.clone(),
                untouched_tasks: self.state.snapshot.tasks.clone(),
                removed: Vec::new(),
            };

            self.scan_registered(docs, &mut pass).await?;

            let directory = self.settings.directory();
            for path in docs.list_documents(&directory).await? {
                if path.extension() != Some(self.settings.extension.as_str()) {
                    continue;
                }
                self.scan_project(docs, path, &mut pass).await?;
            }

            if self.options.is_push {
                self.diff_orphaned_registered(&mut pass);
                let ledger: Vec<TaskId> = self
                    .state
                    .registered_files
                    .values()
                    .flatten()
                    .cloned()
                    .collect();
                for id in &ledger {
                    pass.untouched_tasks.shift_remove(id);
                }
            }

            self.settle_untouched(&mut pass);
            self.mark_dirty(&mut pass);

            info!(
                projects = pass.projects.len(),
                commands = self.queue.len(),
                warnings = self.warnings.len(),
                "diff computed"
            );
            Ok(DiffOutcome {
                projects: pass.projects,
                commands: self.queue,
                warnings: self.warnings,
                removed: pass.removed,
            })
        }

        fn unchanged_since_last_write(&self, path: &DocPath, mtime: i64) -> bool {
            self.options.is_push
                && !self.forced
                && self.state.file_mtimes.get(path) == Some(&mtime)
        }

        /* --------------------------- Registered files --------------------------- */

        async fn scan_registered<D: DocumentStore>(
            &mut self,
            docs: &D,
            pass: &mut Pass,
        ) -> Result<(), StorageError> {
            let entries: Vec<(DocPath, BTreeSet<TaskId>)> = self
                .state
                .registered_files
                .iter()
                .map(|(path, ids)| (path.clone(), ids.clone()))
                .collect();

            for (path, ids) in entries {
                if !docs.document_exists(&path).await {
                    debug!(path = %path, "registered document disappeared");
                    self.state.registered_files.remove(&path);
                    continue;
                }
                let stat = docs.stat_document(&path).await?;
                if self.unchanged_since_last_write(&path, stat.mtime) {
                    debug!(path = %path, "registered document unchanged, skipping");
                    continue;
                }

                let text = docs.read_document(&path).await?;
                let lines = parser::split_lines(&text);
                let ctx = LineContext::new(self.today).with_mtime(stat.mtime);
                let mut body = parser::segment_with(&lines, &ctx, |task| {
                    task.id.as_ref().is_some_and(|id| ids.contains(id))
                });

                let mut found = BTreeSet::new();
                for task in body.iter_mut().filter_map(Fragment::as_task_mut) {
                    let Some(id) = task.id.clone() else { continue };
                    self.recover_priority(task);
                    if let Some(project_id) =
                        self.state.snapshot.task(&id).and_then(|t| t.project_id.clone())
                    {
                        self.forced_projects.insert(project_id);
                    }
                    found.insert(id.clone());
                    self.registered.insert(id, task.clone());
                }

                if found.is_empty() {
                    debug!(path = %path, "registered document no longer holds tracked tasks");
                    self.state.registered_files.remove(&path);
                    continue;
                }
                self.state.registered_files.insert(path.clone(), found);
                pass.projects.insert(
                    format!("registered:{path}"),
                    Project {
                        name: path.file_stem().unwrap_or_default().to_string(),
                        id: None,
                        file_path: Some(path),
                        body,
                        kind: ProjectKind::Registered,
                        has_updates: true,
                        needs_rename: false,
                    },
                );
            }
            Ok(())
        }

        /// Registered tasks no project document mentions are diffed from their registered copy.
        fn diff_orphaned_registered(&mut self, pass: &mut Pass) {
            let orphans: Vec<(TaskId, Task)> = self
                .registered
                .iter()
                .filter(|(id, _)| pass.untouched_tasks.contains_key(*id))
                .map(|(id, task)| (id.clone(), task.clone()))
                .collect();
            for (id, mut task) in orphans {
                let Some(project_id) = self
                    .state
                    .snapshot
                    .task(&id)
                    .and_then(|t| t.project_id.clone())
                else {
                    continue;
                };
                self.diff_task(&mut task, false, &project_id, None);
                pass.untouched_tasks.shift_remove(&id);
            }
        }

        /* --------------------------- Project documents --------------------------- */

        async fn scan_project<D: DocumentStore>(
            &mut self,
            docs: &D,
            path: DocPath,
            pass: &mut Pass,
        ) -> Result<(), StorageError> {
            let parsed_name = naming::from_file_name(path.file_name().unwrap_or_default());
            let name = parsed_name.name;
            let stat = docs.stat_document(&path).await?;
            let known = parsed_name
                .id
                .filter(|id| !pass.projects.contains_key(id.as_str()))
                .and_then(|id| self.state.snapshot.project(&id).cloned());

            if let Some(remote) = &known {
                let forced = self.forced_projects.contains(&remote.id);
                if !forced && self.unchanged_since_last_write(&path, stat.mtime) {
                    debug!(path = %path, "document unchanged since last sync, skipping");
                    pass.untouched_projects.shift_remove(&remote.id);
                    for task_id in self.state.previous_projects.get(&remote.id).into_iter().flatten() {
                        pass.untouched_tasks.shift_remove(task_id);
                    }
                    // Tasks created remotely since the last write are not local deletions.
                    pass.untouched_tasks
                        .retain(|_, task| task.project_id.as_ref() != Some(&remote.id));
                    return Ok(());
                }
            }

            let mut has_updates = false;
            let mut needs_rename = false;
            let project_id = match known {
                Some(remote) => {
                    if remote.name != name {
                        has_updates = true;
                        if self.options.is_push {
                            info!(project = %remote.id, from = %remote.name, to = %name, "renaming project");
                            self.queue.project_update(&remote.id, &name);
                        } else if self.options.can_change {
                            needs_rename = true;
                        }
                    }
                    pass.untouched_projects.shift_remove(&remote.id);
                    remote.id
                }
                None => {
                    has_updates = true;
                    let temp = ProjectId::temporary();
                    if self.options.is_push {
                        info!(path = %path, name = %name, "new project");
                        self.queue.project_add(&name, &temp);
                        needs_rename = true;
                    } else if self.options.can_change {
                        info!(path = %path, "removing document of unknown project");
                        pass.removed.push(path);
                        return Ok(());
                    }
                    temp
                }
            };

            let text = docs.read_document(&path).await?;
            let lines = parser::split_lines(&text);
            let ctx = LineContext::new(self.today)
                .with_project(&project_id)
                .with_mtime(stat.mtime);
            let parsed = parser::segment(&lines, &ctx);

            let mut body = Vec::with_capacity(parsed.len());
            let mut seen: HashSet<TaskId> = HashSet::new();
            for fragment in parsed {
                let mut task = match fragment {
                    Fragment::Task(task) => task,
                    opaque => {
                        body.push(opaque);
                        continue;
                    }
                };
                self.recover_priority(&mut task);
                let original_id = task.id.clone();
                let duplicate = original_id.as_ref().is_some_and(|id| seen.contains(id));
                let known_task = original_id
                    .as_ref()
                    .is_some_and(|id| self.state.snapshot.task(id).is_some());
                let registered = original_id
                    .as_ref()
                    .and_then(|id| self.registered.get(id))
                    .cloned();

                if self.diff_task(&mut task, duplicate, &project_id, registered.as_ref()) {
                    has_updates = true;
                }
                if let Some(id) = original_id {
                    pass.untouched_tasks.shift_remove(&id);
                    seen.insert(id);
                }
                if !self.options.is_push && self.options.can_change && (!known_task || duplicate) {
                    debug!(content = %task.content, "dropping task the remote does not know");
                    has_updates = true;
                    continue;
                }
                body.push(Fragment::Task(task));
            }

            pass.projects.insert(
                project_id.to_string(),
                Project {
                    name,
                    id: Some(project_id),
                    file_path: Some(path),
                    body,
                    kind: ProjectKind::Dedicated,
                    has_updates,
                    needs_rename,
                },
            );
            Ok(())
        }

        fn recover_priority(&self, task: &mut Task) {
            if task.priority.is_none() {
                task.priority = task
                    .id
                    .as_ref()
                    .and_then(|id| self.state.priority_memo.get(id))
                    .copied();
            }
        }

        /* ------------------------------ Task diff ------------------------------ */

        /// Compares one parsed task with the snapshot, queueing or folding the difference.
        /// Returns whether the task counts as updated.
        pub fn diff_task(
            &mut self,
            task: &mut Task,
            duplicate: bool,
            project_id: &ProjectId,
            registered: Option<&Task>,
        ) -> bool {
            let remote = task
                .id
                .as_ref()
                .filter(|_| !duplicate)
                .and_then(|id| self.state.snapshot.task(id))
                .cloned();
            let (Some(id), Some(remote)) = (task.id.clone(), remote) else {
                return self.add_task(task, project_id);
            };

            let mut updated = false;
            if task.priority.is_none() {
                task.priority = remote.priority;
                updated |= !task.priority_or_default().is_default();
            }
            if task.description.is_empty() && !remote.description.is_empty() {
                task.description = remote.description.clone();
                updated |= self.settings.editor.show_description;
            }

            if let Some(copy) = registered.filter(|copy| copy.mtime > task.mtime) {
                let mut copy = copy.clone();
                if copy.priority.is_none() {
                    copy.priority = remote.priority;
                }
                if copy.description.is_empty() {
                    copy.description = remote.description.clone();
                }
                debug!(task = %id, "registered copy is newer, taking its values");
                updated |= task.adopt_fields(&copy);
            }

            let update = ItemUpdateArgs::between(&id, &remote, task);
            if !update.is_empty() {
                if self.options.is_push {
                    updated = true;
                    if self.state.is_completed_remotely(&id) {
                        warn!(task = %id, "skipping update of a completed task");
                        self.warnings.push(format!(
                            "\"{}\" is completed remotely and cannot be edited; the edit was skipped",
                            task.content
                        ));
                    } else {
                        debug!(task = %id, "queueing update");
                        self.queue.item_update(update);
                    }
                } else if !self.options.can_change {
                    let completed = task.completed;
                    task.adopt_fields(&remote);
                    task.completed = completed;
                } else {
                    updated = true;
                }
            }

            if task.completed && !remote.completed {
                updated = true;
                if self.options.is_push {
                    let mut cached = task.clone();
                    cached.project_id = Some(project_id.clone());
                    self.state.completed.insert(id.clone(), cached);
                    self.queue.item_complete(&id);
                } else if self.options.can_change {
                    task.completed = false;
                }
            } else if !task.completed && remote.completed {
                updated = true;
                if self.options.is_push {
                    self.state.completed.remove(&id);
                    self.queue.item_uncomplete(&id);
                } else if self.options.can_change {
                    task.completed = true;
                }
            }
            updated
        }

        fn add_task(&mut self, task: &mut Task, project_id: &ProjectId) -> bool {
            if task.priority.is_none() {
                task.priority = Some(Priority::DEFAULT);
            }
            let temp = TaskId::temporary();
            task.id = Some(temp.clone());
            task.project_id = Some(project_id.clone());
            if !self.options.is_push {
                return false;
            }
            debug!(content = %task.content, "queueing new task");
            self.queue.item_add(ItemAddArgs::from(&*task), &temp);
            if task.completed {
                self.queue.item_complete(&temp);
            }
            true
        }

        /* ---------------------------- Untouched entries ---------------------------- */

        fn settle_untouched(&mut self, pass: &mut Pass) {
            let delete = self.options.is_push && self.options.can_change;
            let inbox = self.state.snapshot.inbox_id.clone();

            for (id, project) in std::mem::take(&mut pass.untouched_projects) {
                if delete {
                    if inbox.as_ref() != Some(&id) {
                        info!(project = %id, "deleting project with no document");
                        self.queue.project_delete(&id);
                    }
                } else {
                    pass.projects.insert(
                        id.to_string(),
                        Project {
                            name: project.name,
                            id: Some(id),
                            file_path: None,
                            body: Vec::new(),
                            kind: ProjectKind::Dedicated,
                            has_updates: true,
                            needs_rename: false,
                        },
                    );
                }
            }

            for (id, task) in std::mem::take(&mut pass.untouched_tasks) {
                if delete {
                    debug!(task = %id, "deleting task missing from every document");
                    self.queue.item_delete(&id);
                    self.state.completed.remove(&id);
                    self.state.priority_memo.remove(&id);
                } else if let Some(project) = task
                    .project_id
                    .as_ref()
                    .and_then(|p| pass.projects.get_mut(p.as_str()))
                {
                    project.body.insert(0, Fragment::Task(task));
                    project.has_updates = true;
                }
            }
        }

        fn mark_dirty(&self, pass: &mut Pass) {
            for project in pass.projects.values_mut() {
                if !self.options.is_push || self.forced {
                    project.has_updates = true;
                }
                if !project.has_updates && format::needs_reorder(&project.body, &self.settings.editor) {
                    debug!(project = %project.name, "sort order violated, rewriting");
                    project.has_updates = true;
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::remote::Operation;
        use crate::state::SortPolicy;
        use crate::storage::MemoryDocumentStore;

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 13).unwrap()
        }

        fn remote_task(id: &str, project: &str, content: &str) -> Task {
            let mut t = Task::new(content);
            t.id = Some(TaskId::from(id));
            t.project_id = Some(ProjectId::from(project));
            t.priority = Some(Priority::DEFAULT);
            t
        }

        fn state_with(projects: &[(&str, &str)], tasks: Vec<Task>) -> SyncState {
            let mut state = SyncState::default();
            for (id, name) in projects {
                state.snapshot.projects.insert(
                    ProjectId::from(*id),
                    RemoteProject {
                        id: ProjectId::from(*id),
                        name: name.to_string(),
                        is_inbox: false,
                    },
                );
            }
            for task in tasks {
                state.snapshot.tasks.insert(task.id.clone().unwrap(), task);
            }
            state.snapshot.cursor = Some("c".into());
            state.editor_fingerprint = Some(Settings::default().editor);
            state
        }

        fn kinds(outcome: &DiffOutcome) -> Vec<&'static str> {
            outcome.commands.as_slice().iter().map(|c| c.op.kind()).collect()
        }

        #[test]
        fn completed_task_edit_warns_without_update() {
            let settings = Settings::default();
            let mut remote = remote_task("7", "1", "Old title");
            remote.completed = true;
            let mut state = state_with(&[("1", "Home")], vec![remote.clone()]);
            state.completed.insert(TaskId::from("7"), remote);

            let mut reconciler = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH);
            let mut local = remote_task("7", "1", "New title");
            local.completed = true;
            let updated = reconciler.diff_task(&mut local, false, &ProjectId::from("1"), None);
            assert!(updated);
            assert!(reconciler.queue.is_empty());
            assert_eq!(reconciler.warnings.len(), 1);
        }

        #[test]
        fn unknown_id_becomes_new_task() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![]);
            let mut reconciler = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH);
            let mut local = Task::new("Fresh");
            local.id = Some(TaskId::from("999"));
            local.completed = true;
            assert!(reconciler.diff_task(&mut local, false, &ProjectId::from("1"), None));
            let temp = local.id.clone().unwrap();
            assert!(temp.is_temporary());
            assert_eq!(local.priority, Some(Priority::DEFAULT));
            let cmds = reconciler.queue.as_slice();
            assert_eq!(cmds[0].temp_id.as_deref(), Some(temp.as_str()));
            assert!(matches!(&cmds[1].op, Operation::ItemComplete(r) if r.id == temp));
        }

        #[test]
        fn newer_registered_copy_wins() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("7", "1", "Remote")]);
            {
                let mut reconciler =
                    Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH);
                let mut local = remote_task("7", "1", "Remote");
                local.mtime = 10;
                let mut copy = remote_task("7", "1", "Edited inline");
                copy.mtime = 20;
                reconciler.diff_task(&mut local, false, &ProjectId::from("1"), Some(&copy));
                assert_eq!(local.content, "Edited inline");
                match &reconciler.queue.as_slice()[0].op {
                    Operation::ItemUpdate(args) => {
                        assert_eq!(args.content.as_deref(), Some("Edited inline"))
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }

            let mut stale = remote_task("7", "1", "Stale inline");
            stale.mtime = 5;
            let mut local = remote_task("7", "1", "Remote");
            local.mtime = 10;
            let mut reconciler = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH);
            assert!(!reconciler.diff_task(&mut local, false, &ProjectId::from("1"), Some(&stale)));
            assert_eq!(local.content, "Remote");
        }

        #[test]
        fn soft_pull_shows_remote_values_without_dirtying() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("7", "1", "Remote")]);
            let mut reconciler =
                Reconciler::new(&mut state, &settings, today(), DiffOptions::SOFT_PULL);
            let mut local = remote_task("7", "1", "Local");
            assert!(!reconciler.diff_task(&mut local, false, &ProjectId::from("1"), None));
            assert_eq!(local.content, "Remote");
            assert!(reconciler.queue.is_empty());
        }

        #[test]
        fn forced_pull_reverts_local_completion() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("7", "1", "Task")]);
            let mut reconciler =
                Reconciler::new(&mut state, &settings, today(), DiffOptions::FORCED_PULL);
            let mut local = remote_task("7", "1", "Task");
            local.completed = true;
            assert!(reconciler.diff_task(&mut local, false, &ProjectId::from("1"), None));
            assert!(!local.completed);
        }

        #[tokio::test]
        async fn push_queues_adds_updates_completions_and_deletes() {
            let settings = Settings::default();
            let mut state = state_with(
                &[("1", "Home"), ("2", "Old")],
                vec![
                    remote_task("10", "1", "Water plants"),
                    remote_task("11", "1", "Fix door"),
                    remote_task("12", "1", "Gone"),
                ],
            );
            let docs = MemoryDocumentStore::new();
            docs.insert(
                "todos/Home - 1.md",
                "# Home\n- [ ] Water plants daily <!--10-->\n- [x] Fix door <!--11-->\n- [ ] Buy paint (p1)\n",
                50,
            );
            docs.insert("todos/Garden.md", "- [ ] Rake leaves\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert_eq!(
                kinds(&outcome),
                vec![
                    "project_add",
                    "item_add",
                    "item_update",
                    "item_complete",
                    "item_add",
                    "project_delete",
                    "item_delete"
                ]
            );
            assert!(state.completed.contains_key(&TaskId::from("11")));
            let home = &outcome.projects["1"];
            assert!(home.has_updates);
            assert!(!home.needs_rename);
            let garden = outcome.projects.values().find(|p| p.name == "Garden").unwrap();
            assert!(garden.needs_rename);
        }

        #[tokio::test]
        async fn unchanged_documents_are_skipped_when_pushing() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("10", "1", "Water")]);
            state
                .file_mtimes
                .insert(DocPath::new("todos/Home - 1.md"), 50);
            state
                .previous_projects
                .insert(ProjectId::from("1"), vec![TaskId::from("10")]);
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Home - 1.md", "- [ ] Changed but not saved? <!--10-->\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert!(outcome.commands.is_empty());
            assert!(outcome.projects.is_empty());
        }

        #[tokio::test]
        async fn remote_tasks_newer_than_an_unchanged_document_survive_push() {
            let settings = Settings::default();
            let mut state = state_with(
                &[("1", "Home")],
                vec![remote_task("10", "1", "Water"), remote_task("11", "1", "Added remotely")],
            );
            state
                .file_mtimes
                .insert(DocPath::new("todos/Home - 1.md"), 50);
            state
                .previous_projects
                .insert(ProjectId::from("1"), vec![TaskId::from("10")]);
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Home - 1.md", "- [ ] Water <!--10-->\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert!(outcome.commands.is_empty(), "{:?}", kinds(&outcome));
        }

        #[tokio::test]
        async fn colliding_project_id_becomes_a_new_project() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Alpha")], vec![remote_task("10", "1", "First")]);
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Alpha - 1.md", "- [ ] First <!--10-->\n", 50);
            docs.insert("todos/Beta - 1.md", "- [ ] Second\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert_eq!(kinds(&outcome), vec!["project_add", "item_add"]);
            let commands = outcome.commands.as_slice();
            let temp = commands[0].temp_id.clone().unwrap();
            match (&commands[0].op, &commands[1].op) {
                (Operation::ProjectAdd(project), Operation::ItemAdd(item)) => {
                    assert_eq!(project.name, "Beta");
                    assert_eq!(item.project_id, Some(ProjectId(temp.clone())));
                }
                other => panic!("unexpected {other:?}"),
            }
            let beta = &outcome.projects[temp.as_str()];
            assert!(beta.needs_rename);
            assert!(!outcome.projects["1"].needs_rename);
        }

        #[tokio::test]
        async fn duplicate_id_in_one_document_is_pushed_as_new_task() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("10", "1", "Water")]);
            let docs = MemoryDocumentStore::new();
            docs.insert(
                "todos/Home - 1.md",
                "- [ ] Water <!--10-->\n- [ ] Water <!--10-->\n",
                50,
            );

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert_eq!(kinds(&outcome), vec!["item_add"]);
            let command = &outcome.commands.as_slice()[0];
            let temp = command.temp_id.clone().unwrap();
            assert!(TaskId(temp.clone()).is_temporary());
            match &command.op {
                Operation::ItemAdd(args) => assert_eq!(args.content, "Water"),
                other => panic!("unexpected {other:?}"),
            }
            let ids: Vec<_> = outcome.projects["1"]
                .tasks()
                .filter_map(|t| t.id.clone())
                .collect();
            assert_eq!(ids, vec![TaskId::from("10"), TaskId(temp)]);
        }

        #[tokio::test]
        async fn pull_materializes_remote_only_entries() {
            let settings = Settings::default();
            let mut state = state_with(
                &[("1", "Home"), ("2", "Work")],
                vec![remote_task("10", "1", "Water"), remote_task("20", "2", "Report")],
            );
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Home - 1.md", "# Home\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::SOFT_PULL)
                .run(&docs)
                .await
                .unwrap();
            assert!(outcome.commands.is_empty());
            let home = &outcome.projects["1"];
            assert_eq!(home.body[0].as_task().map(|t| t.content.as_str()), Some("Water"));
            let work = &outcome.projects["2"];
            assert_eq!(work.file_path, None);
            assert_eq!(work.tasks().count(), 1);
            assert!(outcome.projects.values().all(|p| p.has_updates));
        }

        #[tokio::test]
        async fn forced_pull_drops_local_only_content() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("10", "1", "Water")]);
            let docs = MemoryDocumentStore::new();
            docs.insert(
                "todos/Home - 1.md",
                "- [ ] Water <!--10-->\n- [ ] Water <!--10-->\n- [ ] Local only\n",
                50,
            );
            docs.insert("todos/Stray.md", "- [ ] x\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::FORCED_PULL)
                .run(&docs)
                .await
                .unwrap();
            assert_eq!(outcome.removed, vec![DocPath::new("todos/Stray.md")]);
            assert_eq!(outcome.projects["1"].tasks().count(), 1);
        }

        #[tokio::test]
        async fn registered_copies_force_their_project() {
            let settings = Settings::default();
            let mut state = state_with(&[("1", "Home")], vec![remote_task("10", "1", "Water")]);
            state
                .file_mtimes
                .insert(DocPath::new("todos/Home - 1.md"), 50);
            state.register_file(&DocPath::new("journal/today.md"), [TaskId::from("10")]);
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Home - 1.md", "- [ ] Water <!--10-->\n", 50);
            docs.insert(
                "journal/today.md",
                "Notes\n- [ ] Water twice <!--10-->\n- [ ] untracked <!--44-->\n",
                90,
            );

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert_eq!(kinds(&outcome), vec!["item_update"]);
            let registered = &outcome.projects["registered:journal/today.md"];
            assert_eq!(registered.kind, ProjectKind::Registered);
            assert_eq!(registered.tasks().count(), 1);
        }

        #[tokio::test]
        async fn vanished_registered_documents_leave_the_ledger() {
            let settings = Settings::default();
            let mut state = state_with(&[], vec![]);
            state.register_file(&DocPath::new("gone.md"), [TaskId::from("1")]);
            let docs = MemoryDocumentStore::new();
            Reconciler::new(&mut state, &settings, today(), DiffOptions::SOFT_PULL)
                .run(&docs)
                .await
                .unwrap();
            assert!(state.registered_files.is_empty());
        }

        #[tokio::test]
        async fn sort_violation_marks_project_dirty() {
            let mut settings = Settings::default();
            settings.editor.sort = SortPolicy::Priority;
            let mut state = state_with(
                &[("1", "Home")],
                vec![remote_task("10", "1", "Low"), {
                    let mut t = remote_task("11", "1", "High");
                    t.priority = Some(Priority::new(4).unwrap());
                    t
                }],
            );
            state.editor_fingerprint = Some(settings.editor.clone());
            let docs = MemoryDocumentStore::new();
            docs.insert("todos/Home - 1.md", "- [ ] Low <!--10-->\n- [ ] High (p1) <!--11-->\n", 50);

            let outcome = Reconciler::new(&mut state, &settings, today(), DiffOptions::PUSH)
                .run(&docs)
                .await
                .unwrap();
            assert!(outcome.commands.is_empty());
            assert!(outcome.projects["1"].has_updates);
        }
    }
}

pub mod sync {
    //! Pass orchestration: snapshot refresh, diff, command flush, document write-back.

    use crate::core::*;
    use crate::format::{self, RenderContext};
    use crate::ids::IdResolver;
    use crate::naming::{self, ProjectName};
    use crate::parser::{self, CaptureBlock, CaptureLine, LineContext};
    use crate::reconcile::{DiffOptions, DiffOutcome, Reconciler};
    use crate::remote::{CommandQueue, ItemAddArgs, RemoteError, RemoteService};
    use crate::state::{Settings, SyncState};
    use crate::storage::{DocumentStore, StateStore, StorageError, now_unix};
    use chrono::{Local, NaiveDate};
    use std::collections::HashMap;
    use tracing::{debug, error, info, warn};

    #[derive(Debug, thiserror::Error)]
    pub enum SyncError {
        #[error(transparent)]
        Remote(#[from] RemoteError),
        #[error(transparent)]
        Storage(#[from] StorageError),
    }

    /// Result of one externally triggered operation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyncOutcome {
        pub success: bool,
        pub message: String,
        pub warnings: Vec<String>,
    }

    /// User-facing notification surface of the host.
    pub trait Notifier {
        /// Transient, non-blocking message.
        fn notify(&self, message: &str);

        /// Blocking credential prompt; called when the remote rejects the credential.
        fn request_credentials(&self) {}
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct TracingNotifier;

    impl Notifier for TracingNotifier {
        fn notify(&self, message: &str) {
            info!(target: "todosync::notice", "{message}");
        }

        fn request_credentials(&self) {
            warn!(target: "todosync::notice", "remote credential missing or rejected");
        }
    }

    #[derive(Debug, Default)]
    struct CapturePlan {
        tasks: Vec<Task>,
        filters: Vec<String>,
    }

    pub struct SyncEngine<R, D, S, N> {
        remote: R,
        docs: D,
        store: S,
        notifier: N,
        settings: Settings,
        state: SyncState,
        resolver: IdResolver,
        today: Option<NaiveDate>,
    }

    impl<R, D, S, N> SyncEngine<R, D, S, N>
    where
        R: RemoteService,
        D: DocumentStore,
        S: StateStore,
        N: Notifier,
    {
        pub fn new(
            remote: R,
            docs: D,
            store: S,
            notifier: N,
            settings: Settings,
        ) -> Result<Self, StorageError> {
            let state = store.load()?;
            Ok(Self {
                remote,
                docs,
                store,
                notifier,
                settings,
                state,
                resolver: IdResolver::new(),
                today: None,
            })
        }

        /// Pins the date used for relative due expressions and labels.
        pub fn with_today(mut self, today: NaiveDate) -> Self {
            self.today = Some(today);
            self
        }

        pub fn state(&self) -> &SyncState {
            &self.state
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn docs(&self) -> &D {
            &self.docs
        }

        pub fn remote(&self) -> &R {
            &self.remote
        }

        fn today(&self) -> NaiveDate {
            self.today.unwrap_or_else(|| Local::now().date_naive())
        }

        /* ------------------------------ Operations ------------------------------ */

        pub async fn pull(&mut self, forced: bool) -> SyncOutcome {
            let options = if forced {
                DiffOptions::FORCED_PULL
            } else {
                DiffOptions::SOFT_PULL
            };
            let result = self.run_pull(options).await;
            self.finish(result, if forced { "Forced pull complete" } else { "Pull complete" })
        }

        pub async fn push(&mut self) -> SyncOutcome {
            let result = self.run_push().await;
            self.finish(result, "Push complete")
        }

        /// Turns every capture block of `path` into remote tasks and replaces the block
        /// with the rendered result.
        pub async fn process_capture_blocks(&mut self, path: &DocPath) -> SyncOutcome {
            let result = self.run_capture(path).await;
            self.finish(result, "Captured tasks synced")
        }

        fn finish(&self, result: Result<Vec<String>, SyncError>, done: &str) -> SyncOutcome {
            match result {
                Ok(warnings) => {
                    for warning in &warnings {
                        self.notifier.notify(warning);
                    }
                    info!(warnings = warnings.len(), "{done}");
                    self.notifier.notify(done);
                    SyncOutcome {
                        success: true,
                        message: done.to_string(),
                        warnings,
                    }
                }
                Err(err) => {
                    error!(error = %err, "sync pass failed");
                    let message = format!("Sync failed: {err}");
                    self.notifier.notify(&message);
                    SyncOutcome {
                        success: false,
                        message,
                        warnings: Vec::new(),
                    }
                }
            }
        }

        async fn check_credentials(&self) -> Result<(), SyncError> {
            if let Err(err) = self.remote.health_check().await {
                if matches!(err, RemoteError::Auth(_)) {
                    self.notifier.request_credentials();
                }
                return Err(err.into());
            }
            Ok(())
        }

        async fn run_pull(&mut self, options: DiffOptions) -> Result<Vec<String>, SyncError> {
            self.check_credentials().await?;
            self.resolver.clear();
            self.refresh().await?;
            let outcome = self.diff(options).await?;
            self.write(&outcome, options).await?;
            Ok(outcome.warnings)
        }

        async fn run_push(&mut self) -> Result<Vec<String>, SyncError> {
            self.check_credentials().await?;
            self.resolver.clear();
            if !self.state.snapshot.is_pulled() {
                self.refresh().await?;
            }
            let outcome = self.diff(DiffOptions::PUSH).await?;
            self.store.save(&self.state)?;
            self.flush(&outcome.commands).await?;
            self.refresh().await?;
            self.write(&outcome, DiffOptions::PUSH).await?;
            Ok(outcome.warnings)
        }

        async fn diff(&mut self, options: DiffOptions) -> Result<DiffOutcome, StorageError> {
            let today = self.today();
            Reconciler::new(&mut self.state, &self.settings, today, options)
                .run(&self.docs)
                .await
        }

        /* ------------------------------ Remote I/O ------------------------------ */

        /// Completed tasks first, then a full snapshot; the state is saved afterwards.
        async fn refresh(&mut self) -> Result<(), SyncError> {
            for mut task in self.remote.fetch_completed().await? {
                if let Some(id) = task.id.clone() {
                    task.completed = true;
                    self.state.completed.insert(id, task);
                }
            }
            let payload = self.remote.fetch_snapshot(None).await?;
            self.resolver.extend(payload.temp_id_map.clone());
            self.state.snapshot.apply(payload);
            self.state.snapshot.merge_completed(&self.state.completed);
            info!(
                tasks = self.state.snapshot.tasks.len(),
                projects = self.state.snapshot.projects.len(),
                "snapshot refreshed"
            );
            self.store.save(&self.state)?;
            Ok(())
        }

        /// Chunks are sent one after another; the first failure stops the flush.
        async fn flush(&mut self, commands: &CommandQueue) -> Result<(), RemoteError> {
            if commands.is_empty() {
                return Ok(());
            }
            info!(
                commands = commands.len(),
                chunk_size = self.settings.chunk_size,
                "submitting commands"
            );
            for chunk in commands.chunks(self.settings.chunk_size) {
                let mapping = self.remote.submit_commands(chunk).await?;
                debug!(size = chunk.len(), resolved = mapping.len(), "chunk accepted");
                self.resolver.extend(mapping);
            }
            Ok(())
        }

        /* ------------------------------ Write-back ------------------------------ */

        /// A soft pull keeps local completion toggles; everything else renders the snapshot.
        async fn write(
            &mut self,
            outcome: &DiffOutcome,
            options: DiffOptions,
        ) -> Result<(), StorageError> {
            for path in &outcome.removed {
                info!(path = %path, "removing orphaned document");
                self.docs.remove_document(path).await?;
                self.state.file_mtimes.remove(path);
            }

            let today = self.today();
            for project in outcome.dirty_projects() {
                let body = {
                    let mut ctx = RenderContext::new(&self.settings.editor, today)
                        .with_resolver(&self.resolver)
                        .with_snapshot(&self.state.snapshot);
                    if options == DiffOptions::SOFT_PULL {
                        ctx = ctx.keeping_local_completion();
                    }
                    format::arrange_body(&project.body, &ctx)
                };
                let text = {
                    let ctx = RenderContext::new(&self.settings.editor, today);
                    format::emit_body(&body, &ctx)
                };

                let target = self.target_path(project);
                if let Some(current) = project.file_path.as_ref().filter(|p| **p != target) {
                    if self.docs.document_exists(current).await {
                        info!(from = %current, to = %target, "renaming project document");
                        self.docs.rename_document(current, &target).await?;
                        self.state.file_mtimes.remove(current);
                    }
                }

                let mtime = now_unix();
                self.docs.write_document(&target, &text, mtime).await?;
                debug!(path = %target, "document written");
                if self.has_unpushed_completion(&body) {
                    // The next push must rescan this document.
                    self.state.file_mtimes.remove(&target);
                } else {
                    self.state.file_mtimes.insert(target, mtime);
                }
                self.remember(project, &body);
            }

            self.state.editor_fingerprint = Some(self.settings.editor.clone());
            self.store.save(&self.state)
        }

        /// Registered documents stay put. Project documents are named after the
        /// snapshot once the project is known remotely.
        fn target_path(&self, project: &Project) -> DocPath {
            let current = project.file_path.as_ref();
            if project.kind == ProjectKind::Registered {
                if let Some(path) = current {
                    return path.clone();
                }
            }
            let directory = current
                .and_then(DocPath::parent)
                .unwrap_or_else(|| self.settings.directory());
            let extension = &self.settings.extension;

            let remote = project
                .id
                .as_ref()
                .map(|id| self.resolver.project(id))
                .and_then(|id| self.state.snapshot.project(&id));
            match remote {
                Some(remote) => {
                    let name = if project.needs_rename || current.is_none() {
                        remote.name.clone()
                    } else {
                        project.name.clone()
                    };
                    let name = ProjectName {
                        name,
                        id: Some(remote.id.clone()),
                    };
                    naming::project_path(&directory, &name, extension)
                }
                None => current.cloned().unwrap_or_else(|| {
                    let name = ProjectName {
                        name: project.name.clone(),
                        id: None,
                    };
                    naming::project_path(&directory, &name, extension)
                }),
            }
        }

        fn has_unpushed_completion(&self, body: &[Fragment]) -> bool {
            body.iter().filter_map(Fragment::as_task).any(|task| {
                task.id
                    .as_ref()
                    .and_then(|id| self.state.snapshot.task(id))
                    .is_some_and(|remote| remote.completed != task.completed)
            })
        }

        /// Records the written task ids and priorities for the next pass.
        fn remember(&mut self, project: &Project, body: &[Fragment]) {
            let mut ids = Vec::new();
            for task in body.iter().filter_map(Fragment::as_task) {
                let Some(id) = task.id.as_ref().filter(|id| !id.is_temporary()) else {
                    continue;
                };
                if let Some(priority) = task.priority {
                    self.state.priority_memo.insert(id.clone(), priority);
                }
                ids.push(id.clone());
            }
            if project.kind != ProjectKind::Dedicated {
                return;
            }
            if let Some(project_id) = project
                .id
                .as_ref()
                .map(|id| self.resolver.project(id))
                .filter(|id| !id.is_temporary())
            {
                self.state.previous_projects.insert(project_id, ids);
            }
        }

        /* ---------------------------- Capture blocks ---------------------------- */

        async fn run_capture(&mut self, path: &DocPath) -> Result<Vec<String>, SyncError> {
            self.check_credentials().await?;
            self.resolver.clear();
            self.refresh().await?;

            let text = self.docs.read_document(path).await?;
            let lines = parser::split_lines(&text);
            let blocks = parser::find_capture_blocks(&lines);
            if blocks.is_empty() {
                debug!(path = %path, "no capture blocks");
                return Ok(Vec::new());
            }
            info!(path = %path, blocks = blocks.len(), "processing capture blocks");

            let today = self.today();
            let mut queue = CommandQueue::new();
            let mut new_projects = HashMap::new();
            let plans: Vec<CapturePlan> = blocks
                .iter()
                .map(|block| self.plan_capture(block, today, &mut queue, &mut new_projects))
                .collect();
            self.flush(&queue).await?;
            self.refresh().await?;

            let mut warnings = Vec::new();
            let mut rendered = Vec::with_capacity(plans.len());
            let mut captured_ids = Vec::new();
            for plan in plans {
                let mut body: Body = plan.tasks.into_iter().map(Fragment::Task).collect();
                for filter in &plan.filters {
                    match self.remote.query_by_filter(filter).await {
                        Ok(tasks) => body.extend(tasks.into_iter().map(Fragment::Task)),
                        Err(err) => {
                            warn!(filter = %filter, error = %err, "filter query failed");
                            warnings.push(format!("Filter \"{filter}\" failed: {err}"));
                        }
                    }
                }
                let ctx = RenderContext::new(&self.settings.editor, today)
                    .with_resolver(&self.resolver)
                    .with_snapshot(&self.state.snapshot);
                let arranged = format::arrange_body(&body, &ctx);
                captured_ids.extend(
                    arranged
                        .iter()
                        .filter_map(Fragment::as_task)
                        .filter_map(|task| task.id.clone())
                        .filter(|id| !id.is_temporary()),
                );
                rendered.push(format::emit_body(&arranged, &ctx));
            }

            let mut out: Vec<&str> = Vec::with_capacity(lines.len());
            let mut next = 0;
            for (block, replacement) in blocks.iter().zip(&rendered) {
                out.extend_from_slice(&lines[next..block.start]);
                if !replacement.is_empty() {
                    out.push(replacement.as_str());
                }
                next = block.end + 1;
            }
            out.extend_from_slice(&lines[next.min(lines.len())..]);
            let mut new_text = out.join("\n");
            if text.ends_with('\n') {
                new_text.push('\n');
            }

            let mtime = now_unix();
            self.docs.write_document(path, &new_text, mtime).await?;
            self.state.file_mtimes.insert(path.clone(), mtime);
            self.state.register_file(path, captured_ids);
            self.store.save(&self.state)?;
            Ok(warnings)
        }

        /// Parses one block and queues its project and task commands.
        fn plan_capture(
            &self,
            block: &CaptureBlock,
            today: NaiveDate,
            queue: &mut CommandQueue,
            new_projects: &mut HashMap<String, ProjectId>,
        ) -> CapturePlan {
            let ctx = LineContext::new(today);
            let mut project = self.state.snapshot.inbox_id.clone();
            let mut plan = CapturePlan::default();

            for line in &block.lines {
                match parser::parse_capture_line(line, &ctx) {
                    Some(CaptureLine::Task(mut task)) => {
                        task.project_id = project.clone();
                        plan.tasks.push(task);
                    }
                    Some(CaptureLine::Project(name)) => {
                        let id = match self.state.snapshot.find_project(&name) {
                            Some(remote) => remote.id.clone(),
                            None => new_projects
                                .entry(name.clone())
                                .or_insert_with(|| {
                                    let temp = ProjectId::temporary();
                                    info!(name = %name, "capturing into a new project");
                                    queue.project_add(&name, &temp);
                                    temp
                                })
                                .clone(),
                        };
                        project = Some(id);
                    }
                    Some(CaptureLine::Description(text)) => {
                        if let Some(task) = plan.tasks.last_mut() {
                            task.description = text;
                        }
                    }
                    Some(CaptureLine::Filter(expression)) => plan.filters.push(expression),
                    None => {}
                }
            }

            for task in &mut plan.tasks {
                if task.priority.is_none() {
                    task.priority = Some(Priority::DEFAULT);
                }
                let temp = TaskId::temporary();
                task.id = Some(temp.clone());
                queue.item_add(ItemAddArgs::from(&*task), &temp);
                if task.completed {
                    queue.item_complete(&temp);
                }
            }
            plan
        }
    }

}

pub mod logging {
    //! Subscriber setup for hosts and the CLI.

    use tracing_subscriber::EnvFilter;

    /// Installs a stderr `fmt` subscriber. `RUST_LOG` wins over `verbose`.
    /// A subscriber that is already installed is left in place.
    pub fn init(verbose: bool) {
        let default = if verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(verbose)
            .try_init();
    }

}
