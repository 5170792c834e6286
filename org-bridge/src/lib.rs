//! Org-bridge library: turns structured TODO fields into org-mode text and files
//! that text into plain outline files.
//! The renderer is pure; all file I/O lives in `insert`, and the request layer on
//! top validates what automation tools send before anything touches the disk.

pub mod model {
    use indexmap::IndexMap;
    use std::{
        io,
        path::{Path, PathBuf},
    };

    /* ------------------------------- Entry ------------------------------- */

    /// A TODO entry handed over by the request layer. Built per request; only its
    /// rendered text is ever persisted.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TodoEntry {
        pub title: String,
        /// Free-form state keyword (TODO, NEXT, DONE, ...), not checked against a vocabulary.
        pub state: String,
        /// Priority cookie content, rendered as `[#X]`.
        pub priority: Option<String>,
        /// Rendered in the given order.
        pub tags: Vec<String>,
        pub scheduled: Option<PlanningTime>,
        pub deadline: Option<PlanningTime>,
        /// Caller properties. Keys are upper-cased when rendered and `ID` is always replaced.
        pub properties: IndexMap<String, String>,
        pub body: Option<String>,
        /// Parent heading to file the entry under; `None` appends at end of file.
        pub heading: Option<String>,
    }

    impl TodoEntry {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                state: "TODO".to_string(),
                priority: None,
                tags: vec![],
                scheduled: None,
                deadline: None,
                properties: IndexMap::new(),
                body: None,
                heading: None,
            }
        }
    }

    /// A SCHEDULED or DEADLINE value as received, plus how to render it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlanningTime {
        /// ISO-8601-like input, e.g. `2025-01-20` or `2025-01-20T14:30:00+01:00`.
        pub value: String,
        pub include_time: bool,
        pub recurrence: Option<Recurrence>,
    }

    impl PlanningTime {
        pub fn new(value: impl Into<String>) -> Self {
            Self {
                value: value.into(),
                include_time: false,
                recurrence: None,
            }
        }

        pub fn with_time(mut self) -> Self {
            self.include_time = true;
            self
        }

        pub fn repeating(mut self, recurrence: Recurrence) -> Self {
            self.recurrence = Some(recurrence);
            self
        }
    }

    /* ----------------------------- Recurrence ----------------------------- */

    /// Repeater cookie such as `+1w`, `.+2d` or `++1m`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Recurrence {
        pub every: u32,
        pub unit: RepeatUnit,
        pub kind: RepeatType,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RepeatUnit {
        Hours,
        Days,
        Weeks,
        Months,
        Years,
    }

    impl RepeatUnit {
        /// Lenient lookup; anything unrecognized repeats in days.
        pub fn from_name(name: &str) -> Self {
            match name.trim().to_ascii_lowercase().as_str() {
                "h" | "hour" | "hours" => Self::Hours,
                "w" | "week" | "weeks" => Self::Weeks,
                "m" | "month" | "months" => Self::Months,
                "y" | "year" | "years" => Self::Years,
                _ => Self::Days,
            }
        }

        pub fn letter(self) -> char {
            match self {
                Self::Hours => 'h',
                Self::Days => 'd',
                Self::Weeks => 'w',
                Self::Months => 'm',
                Self::Years => 'y',
            }
        }
    }

    /// `+` (standard), `.+` (from completion), `++` (catch up).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RepeatType {
        Standard,
        FromCompletion,
        CatchUp,
    }

    impl RepeatType {
        /// Lenient lookup; anything unrecognized is a standard repeater.
        pub fn from_name(name: &str) -> Self {
            match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                "from_completion" | ".+" => Self::FromCompletion,
                "catch_up" | "catchup" | "++" => Self::CatchUp,
                _ => Self::Standard,
            }
        }

        pub fn cookie(self) -> &'static str {
            match self {
                Self::Standard => "+",
                Self::FromCompletion => ".+",
                Self::CatchUp => "++",
            }
        }
    }

    /// Which planning field carries the recurrence.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RecurringField {
        #[default]
        Scheduled,
        Deadline,
    }

    impl RecurringField {
        pub fn from_name(name: &str) -> Option<Self> {
            match name.trim().to_ascii_lowercase().as_str() {
                "scheduled" => Some(Self::Scheduled),
                "deadline" => Some(Self::Deadline),
                _ => None,
            }
        }
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum BridgeError {
        #[error("invalid timestamp {input:?}: {reason}")]
        Parse { input: String, reason: String },
        #[error("i/o failure on {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("invalid request: {0}")]
        Validation(String),
        #[error("org directory {0:?} does not exist")]
        DirectoryNotFound(PathBuf),
    }

    impl BridgeError {
        pub(crate) fn io(path: &Path, source: io::Error) -> Self {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }

        /// HTTP status a REST wrapper answers with for this failure.
        pub fn status_code(&self) -> u16 {
            match self {
                Self::Parse { .. } | Self::Validation(_) => 400,
                Self::DirectoryNotFound(_) => 404,
                Self::Io { .. } => 500,
            }
        }
    }

}

pub mod timestamp {
    //! ISO-8601-like input to org timestamps.
    //!
    //! Accepted input: `YYYY-MM-DD`, optionally followed by `T` (or a space) and
    //! `HH:MM[:SS[.fff]]`, optionally followed by a zone (`Z`, `+HH:MM`, `-HHMM`, `+HH`).
    //! The zone is dropped: wall-clock values are used exactly as written.

    use crate::model::{BridgeError, PlanningTime, Recurrence};
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, digit1},
        combinator::{all_consuming, map_res, opt, recognize},
        error::VerboseError,
        sequence::{preceded, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Wall-clock value parsed from request input; `time` is `None` for date-only input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WallClock {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    pub fn parse_wall_clock(input: &str) -> Result<WallClock, BridgeError> {
        all_consuming(wall_clock)(input.trim())
            .map(|(_, value)| value)
            .map_err(|err| BridgeError::Parse {
                input: input.to_string(),
                reason: describe(err),
            })
    }

    /// Render `<YYYY-MM-DD[ HH:MM][ cookie]>`. Date-only input rendered with time shows `00:00`.
    pub fn format_timestamp(
        input: &str,
        include_time: bool,
        recurrence: Option<&Recurrence>,
    ) -> Result<String, BridgeError> {
        let value = parse_wall_clock(input)?;
        let mut buf = String::from("<");
        buf.push_str(&value.date.format("%Y-%m-%d").to_string());
        if include_time {
            buf.push(' ');
            match value.time {
                Some(time) => buf.push_str(&time.format("%H:%M").to_string()),
                None => buf.push_str("00:00"),
            }
        }
        if let Some(Recurrence { every, unit, kind }) = recurrence {
            buf.push(' ');
            buf.push_str(kind.cookie());
            buf.push_str(&every.to_string());
            buf.push(unit.letter());
        }
        buf.push('>');
        Ok(buf)
    }

    pub fn render_planning_time(time: &PlanningTime) -> Result<String, BridgeError> {
        format_timestamp(&time.value, time.include_time, time.recurrence.as_ref())
    }

    fn describe(err: nom::Err<VerboseError<&str>>) -> String {
        match err {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => match ve.errors.first() {
                Some((rest, _)) if rest.is_empty() => {
                    "unexpected end of input, expected YYYY-MM-DD[THH:MM[:SS]]".to_string()
                }
                Some((rest, _)) => format!("unexpected input at {:?}", rest),
                None => "unrecognized format".to_string(),
            },
            nom::Err::Incomplete(_) => "incomplete input".to_string(),
        }
    }

    fn wall_clock(i: &str) -> PResult<'_, WallClock> {
        let (i, date) = parse_date(i)?;
        // A zone is only meaningful after a time of day.
        let (i, time) = opt(terminated(
            preceded(alt((char('T'), char('t'), char(' '))), parse_time),
            opt(parse_zone),
        ))(i)?;
        Ok((i, WallClock { date, time }))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                two_digits,
                char('-'),
                two_digits,
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                two_digits,
                char(':'),
                two_digits,
                opt(preceded(char(':'), two_digits)),
                // fractional seconds; precision below a minute is never rendered
                opt(preceded(alt((char('.'), char(','))), digit1)),
            )),
            |(h, _, m, s, _)| NaiveTime::from_hms_opt(h, m, s.unwrap_or(0)).ok_or("invalid time"),
        )(i)
    }

    fn parse_zone(i: &str) -> PResult<'_, &str> {
        alt((
            tag("Z"),
            tag("z"),
            recognize(tuple((
                alt((char('+'), char('-'))),
                two_digits,
                opt(preceded(opt(char(':')), two_digits)),
            ))),
        ))(i)
    }

    fn two_digits(i: &str) -> PResult<'_, u32> {
        map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
            s.parse::<u32>()
        })(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::{RepeatType, RepeatUnit};

        #[test]
        fn date_only_input() {
            assert_eq!(format_timestamp("2025-01-20", false, None).unwrap(), "<2025-01-20>");
            assert_eq!(
                format_timestamp("2025-01-20", true, None).unwrap(),
                "<2025-01-20 00:00>"
            );
        }

        #[test]
        fn datetime_input_keeps_wall_clock() {
            for input in [
                "2025-01-20T14:30:00",
                "2025-01-20T14:30",
                "2025-01-20 14:30",
                "2025-01-20T14:30:00Z",
                "2025-01-20T14:30:00+05:00",
                "2025-01-20T14:30:00.123-0800",
                " 2025-01-20T14:30:59+01 ",
            ] {
                assert_eq!(
                    format_timestamp(input, true, None).unwrap(),
                    "<2025-01-20 14:30>",
                    "input {input:?}"
                );
            }
        }

        #[test]
        fn time_is_dropped_when_not_requested() {
            assert_eq!(
                format_timestamp("2025-01-20T14:30:00", false, None).unwrap(),
                "<2025-01-20>"
            );
        }

        #[test]
        fn recurrence_cookie_is_appended() {
            let every_two_weeks = Recurrence {
                every: 2,
                unit: RepeatUnit::Weeks,
                kind: RepeatType::FromCompletion,
            };
            assert_eq!(
                format_timestamp("2025-02-03", false, Some(&every_two_weeks)).unwrap(),
                "<2025-02-03 .+2w>"
            );

            let hourly = Recurrence {
                every: 1,
                unit: RepeatUnit::Hours,
                kind: RepeatType::CatchUp,
            };
            assert_eq!(
                format_timestamp("2025-01-20T14:30:00", true, Some(&hourly)).unwrap(),
                "<2025-01-20 14:30 ++1h>"
            );
        }

        #[test]
        fn malformed_input_is_a_parse_error() {
            for input in [
                "",
                "tomorrow",
                "2025-13-01",
                "2025-02-30",
                "2025-1-20",
                "2025-01-20T25:00",
                "2025-01-20T14:30 extra",
                "2025-01-20Z",
            ] {
                let err = parse_wall_clock(input).unwrap_err();
                assert!(
                    matches!(err, BridgeError::Parse { input: ref got, .. } if got == input),
                    "input {input:?} gave {err:?}"
                );
            }
        }
    }
}

pub mod ids {
    //! Identifier generation.

    use uuid::Uuid;

    /// Source of the `ID` property value injected into every rendered entry.
    pub trait IdGenerator {
        fn generate(&self) -> String;
    }

    /// Random UUIDv4 identifiers.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn generate(&self) -> String {
            Uuid::new_v4().to_string()
        }
    }

    /// Fresh API key for the `ORG_BRIDGE_API_KEY` setting.
    pub fn generate_api_key() -> String {
        Uuid::new_v4().to_string()
    }


}

pub mod render {
    //! Entry Renderer: structured fields in, org text out. No I/O.
    //!
    //! Line order is fixed: headline, planning line, property drawer, then the body
    //! after one blank line. The result has no trailing newline.

    use crate::model::{BridgeError, TodoEntry};
    use crate::timestamp::render_planning_time;
    use indexmap::IndexMap;

    pub const ID_PROPERTY: &str = "ID";

    /// Render `entry` at nesting `level` with `id` injected into its property drawer.
    pub fn render_entry(entry: &TodoEntry, level: usize, id: &str) -> Result<String, BridgeError> {
        let mut lines = vec![render_headline(entry, level)];
        if let Some(planning) = render_planning(entry)? {
            lines.push(planning);
        }
        lines.push(":PROPERTIES:".to_string());
        for (key, value) in property_drawer(&entry.properties, id) {
            lines.push(format!(":{key}: {value}"));
        }
        lines.push(":END:".to_string());
        push_body(&mut lines, entry);
        Ok(lines.join("\n"))
    }

    /// Same layout as [`render_entry`] minus the property drawer.
    pub fn render_entry_without_properties(
        entry: &TodoEntry,
        level: usize,
    ) -> Result<String, BridgeError> {
        let mut lines = vec![render_headline(entry, level)];
        if let Some(planning) = render_planning(entry)? {
            lines.push(planning);
        }
        push_body(&mut lines, entry);
        Ok(lines.join("\n"))
    }

    /// `** STATE [#P] Title :tag1:tag2:`
    pub fn render_headline(entry: &TodoEntry, level: usize) -> String {
        debug_assert!(level > 0, "heading level must be at least 1");
        let mut parts = vec![format!("{} {}", "*".repeat(level.max(1)), entry.state)];
        if let Some(priority) = entry.priority.as_deref().filter(|p| !p.is_empty()) {
            parts.push(format!("[#{priority}]"));
        }
        parts.push(entry.title.clone());
        if !entry.tags.is_empty() {
            parts.push(format!(":{}:", entry.tags.join(":")));
        }
        parts.join(" ")
    }

    /// One line holding SCHEDULED and/or DEADLINE, or `None` when neither is set.
    pub fn render_planning(entry: &TodoEntry) -> Result<Option<String>, BridgeError> {
        let mut parts = Vec::new();
        if let Some(scheduled) = &entry.scheduled {
            parts.push(format!("SCHEDULED: {}", render_planning_time(scheduled)?));
        }
        if let Some(deadline) = &entry.deadline {
            parts.push(format!("DEADLINE: {}", render_planning_time(deadline)?));
        }
        Ok((!parts.is_empty()).then(|| parts.join(" ")))
    }

    /// Copy of the caller properties with upper-cased keys and `ID` set to `id`.
    /// A caller-supplied `ID` keeps its position; otherwise `ID` comes last.
    pub fn property_drawer(props: &IndexMap<String, String>, id: &str) -> IndexMap<String, String> {
        let mut drawer = IndexMap::with_capacity(props.len() + 1);
        for (key, value) in props {
            drawer.insert(key.to_uppercase(), value.clone());
        }
        drawer.insert(ID_PROPERTY.to_string(), id.to_string());
        drawer
    }

    fn push_body(lines: &mut Vec<String>, entry: &TodoEntry) {
        if let Some(body) = entry.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            lines.push(String::new());
            lines.push(body.to_string());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::{PlanningTime, Recurrence, RepeatType, RepeatUnit};

        fn pay_rent() -> TodoEntry {
            let mut entry = TodoEntry::new("Pay rent");
            entry.priority = Some("A".into());
            entry.tags = vec!["home".into(), "bills".into()];
            entry
        }

        #[test]
        fn headline_with_priority_and_tags() {
            let text = render_entry(&pay_rent(), 1, "id-1").unwrap();
            assert_eq!(
                text,
                "* TODO [#A] Pay rent :home:bills:\n:PROPERTIES:\n:ID: id-1\n:END:"
            );
        }

        #[test]
        fn minimal_headline_omits_priority_and_tags() {
            let mut entry = TodoEntry::new("Call mom");
            entry.state = "NEXT".into();
            entry.priority = Some(String::new());
            assert_eq!(render_headline(&entry, 3), "*** NEXT Call mom");
        }

        #[cfg(debug_assertions)]
        #[test]
        #[should_panic(expected = "heading level must be at least 1")]
        fn level_zero_is_a_caller_bug() {
            render_headline(&TodoEntry::new("x"), 0);
        }

        #[test]
        fn headline_round_trips() {
            let entry = pay_rent();
            let line = render_headline(&entry, 2);

            let rest = line.trim_start_matches('*').trim();
            let (state, rest) = rest.split_once(' ').unwrap();
            let (priority, rest) = rest.split_once(' ').unwrap();
            let (title, tags) = rest.rsplit_once(' ').unwrap();
            let tags: Vec<&str> = tags.split(':').filter(|t| !t.is_empty()).collect();

            assert_eq!(state, entry.state);
            assert_eq!(priority, "[#A]");
            assert_eq!(title, entry.title);
            assert_eq!(tags, vec!["home", "bills"]);
        }

        #[test]
        fn scheduled_with_time() {
            let mut entry = TodoEntry::new("Dentist");
            entry.scheduled = Some(PlanningTime::new("2025-01-20T14:30:00").with_time());
            let text = render_entry(&entry, 1, "id-1").unwrap();
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!(lines[1], "SCHEDULED: <2025-01-20 14:30>");
        }

        #[test]
        fn both_planning_fields_share_one_line() {
            let mut entry = TodoEntry::new("Report");
            entry.scheduled = Some(PlanningTime::new("2025-01-27"));
            entry.deadline = Some(PlanningTime::new("2025-02-03").repeating(Recurrence {
                every: 2,
                unit: RepeatUnit::Weeks,
                kind: RepeatType::FromCompletion,
            }));
            assert_eq!(
                render_planning(&entry).unwrap().as_deref(),
                Some("SCHEDULED: <2025-01-27> DEADLINE: <2025-02-03 .+2w>")
            );
        }

        #[test]
        fn deadline_alone() {
            let mut entry = TodoEntry::new("Taxes");
            entry.deadline = Some(PlanningTime::new("2025-04-15"));
            assert_eq!(
                render_planning(&entry).unwrap().as_deref(),
                Some("DEADLINE: <2025-04-15>")
            );
        }

        #[test]
        fn no_planning_line_without_dates() {
            assert_eq!(render_planning(&TodoEntry::new("x")).unwrap(), None);
        }

        #[test]
        fn properties_are_upper_cased_and_id_is_forced() {
            let mut entry = TodoEntry::new("Ship it");
            entry.properties.insert("effort".into(), "1:00".into());
            entry.properties.insert("Id".into(), "caller-id".into());
            entry.properties.insert("source".into(), "zapier".into());

            let text = render_entry(&entry, 1, "id-9").unwrap();
            assert_eq!(
                text,
                "* TODO Ship it\n:PROPERTIES:\n:EFFORT: 1:00\n:ID: id-9\n:SOURCE: zapier\n:END:"
            );
            // caller data is left untouched
            assert_eq!(entry.properties.get("Id").map(String::as_str), Some("caller-id"));
        }

        #[test]
        fn body_follows_one_blank_line() {
            let mut entry = TodoEntry::new("Read");
            entry.body = Some("\n  Chapter 3\nand 4  \n\n".into());
            let text = render_entry(&entry, 1, "id-1").unwrap();
            assert!(text.ends_with(":END:\n\nChapter 3\nand 4"), "{text}");
            assert!(!text.ends_with('\n'));
        }

        #[test]
        fn blank_body_is_ignored() {
            let mut entry = TodoEntry::new("Read");
            entry.body = Some("   ".into());
            assert!(render_entry(&entry, 1, "id-1").unwrap().ends_with(":END:"));
        }

        #[test]
        fn without_properties_keeps_other_fields() {
            let mut entry = pay_rent();
            entry.scheduled = Some(PlanningTime::new("2025-01-20"));
            entry.body = Some("first of the month".into());
            assert_eq!(
                render_entry_without_properties(&entry, 2).unwrap(),
                "** TODO [#A] Pay rent :home:bills:\nSCHEDULED: <2025-01-20>\n\nfirst of the month"
            );
        }

        #[test]
        fn bad_timestamp_fails_render() {
            let mut entry = TodoEntry::new("x");
            entry.deadline = Some(PlanningTime::new("next friday"));
            assert!(matches!(
                render_entry(&entry, 1, "id"),
                Err(BridgeError::Parse { .. })
            ));
        }
    }
}

pub mod insert {
    //! File Inserter.
    //!
    //! Mode A appends an entry at end of file so entries are separated by exactly one
    //! blank line. Mode B files an entry one level below a named heading, creating the
    //! heading at end of file when it is missing. Splice planning works on text and is
    //! pure; `append_entry` and `insert_under_heading` own the I/O.
    //!
    //! Concurrent writers targeting the same file are not coordinated.

    use crate::model::{BridgeError, TodoEntry};
    use crate::render::{render_entry, render_entry_without_properties};
    use std::{
        fs,
        fs::OpenOptions,
        io::{self, Write},
        path::{Path, PathBuf},
    };
    use tempfile::NamedTempFile;

    /// Where an entry ended up.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Placement {
        /// The file did not exist and was created.
        Created,
        /// The file held only whitespace and was replaced.
        Replaced,
        /// Appended after existing content.
        Appended,
        /// Inserted below an existing heading; `line` is the 0-based line of the entry's headline.
        UnderHeading { level: usize, line: usize },
        /// The heading was missing and got created at end of file.
        NewHeading,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Inserted {
        /// Exact block written (without surrounding blank lines).
        pub text: String,
        pub placement: Placement,
    }

    /* ------------------------------ Mode A ------------------------------ */

    /// How an appended entry joins the existing content.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AppendPlan {
        Create,
        Overwrite,
        /// Append after this separator.
        Append(&'static str),
    }

    pub fn plan_append(existing: Option<&str>) -> AppendPlan {
        match existing {
            None => AppendPlan::Create,
            Some(text) if text.trim().is_empty() => AppendPlan::Overwrite,
            Some(text) if text.ends_with("\n\n") => AppendPlan::Append(""),
            Some(text) if text.ends_with('\n') => AppendPlan::Append("\n"),
            Some(_) => AppendPlan::Append("\n\n"),
        }
    }

    /// Mode A: append `text` plus a trailing newline.
    pub fn append_entry(path: &Path, text: &str) -> Result<Placement, BridgeError> {
        ensure_parent_dir(path)?;
        let existing = read_optional(path)?;
        match plan_append(existing.as_deref()) {
            AppendPlan::Create => {
                fs::write(path, format!("{text}\n")).map_err(|e| BridgeError::io(path, e))?;
                Ok(Placement::Created)
            }
            AppendPlan::Overwrite => {
                replace_contents(path, &format!("{text}\n"))?;
                Ok(Placement::Replaced)
            }
            AppendPlan::Append(separator) => {
                let mut file = OpenOptions::new()
                    .append(true)
                    .open(path)
                    .map_err(|e| BridgeError::io(path, e))?;
                file.write_all(format!("{separator}{text}\n").as_bytes())
                    .map_err(|e| BridgeError::io(path, e))?;
                Ok(Placement::Appended)
            }
        }
    }

    /* ------------------------------ Mode B ------------------------------ */

    /// Number of leading `*` when the (left-trimmed) line is a heading.
    pub fn heading_level(line: &str) -> Option<usize> {
        let stars = line.trim_start().chars().take_while(|c| *c == '*').count();
        (stars > 0).then_some(stars)
    }

    /// Heading text without the stars and without a trailing tag suffix.
    pub fn heading_text(line: &str) -> Option<&str> {
        let level = heading_level(line)?;
        let rest = line.trim_start()[level..].trim();
        Some(strip_tags(rest))
    }

    /// Drops the last whitespace-separated token when the text ends in `:`.
    /// A single token is kept so a heading never collapses to nothing.
    fn strip_tags(text: &str) -> &str {
        if !text.ends_with(':') {
            return text;
        }
        match text.rsplit_once(char::is_whitespace) {
            Some((head, _)) => head.trim_end(),
            None => text,
        }
    }

    /// First heading whose text equals `name` (both trimmed) as `(line index, level)`.
    /// Duplicate names resolve to the first occurrence.
    pub fn find_heading<S: AsRef<str>>(lines: &[S], name: &str) -> Option<(usize, usize)> {
        let wanted = name.trim();
        lines.iter().enumerate().find_map(|(idx, line)| {
            let line = line.as_ref();
            let level = heading_level(line)?;
            (heading_text(line)? == wanted).then_some((idx, level))
        })
    }

    /// Index of the first later heading at `level` or shallower, else `lines.len()`.
    pub fn section_end<S: AsRef<str>>(lines: &[S], heading_idx: usize, level: usize) -> usize {
        lines
            .iter()
            .enumerate()
            .skip(heading_idx + 1)
            .find(|(_, line)| heading_level(line.as_ref()).is_some_and(|l| l <= level))
            .map(|(idx, _)| idx)
            .unwrap_or(lines.len())
    }

    /// Mode B on text: returns the new file content and what was inserted.
    /// CRLF content stays CRLF; `Inserted::text` is always `\n`-joined.
    pub fn splice_under_heading(
        content: &str,
        heading: &str,
        entry: &TodoEntry,
        id: &str,
    ) -> Result<(String, Inserted), BridgeError> {
        let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let mut lines: Vec<String> = content.lines().map(String::from).collect();

        let inserted = match find_heading(&lines, heading) {
            Some((idx, level)) => {
                let text = render_entry(entry, level + 1, id)?;
                let at = section_end(&lines, idx, level);

                let mut block = Vec::new();
                if at > 0 && !is_blank(&lines[at - 1]) {
                    block.push(String::new());
                }
                let line = at + block.len();
                block.extend(text.lines().map(String::from));
                if at < lines.len() && !is_blank(&lines[at]) {
                    block.push(String::new());
                }
                lines.splice(at..at, block);

                Inserted {
                    text,
                    placement: Placement::UnderHeading { level, line },
                }
            }
            None => {
                // This path writes no property drawer.
                let child = render_entry_without_properties(entry, 2)?;
                let text = format!("* {}\n\n{}", heading.trim(), child);
                if lines.last().is_some_and(|l| !is_blank(l)) {
                    lines.push(String::new());
                }
                lines.extend(text.lines().map(String::from));

                Inserted {
                    text,
                    placement: Placement::NewHeading,
                }
            }
        };

        let mut updated = lines.join(newline);
        updated.push_str(newline);
        Ok((updated, inserted))
    }

    /// Mode B: file `entry` under `heading`, rewriting the whole file.
    pub fn insert_under_heading(
        path: &Path,
        heading: &str,
        entry: &TodoEntry,
        id: &str,
    ) -> Result<Inserted, BridgeError> {
        ensure_parent_dir(path)?;
        let existing = read_optional(path)?.unwrap_or_default();
        let (updated, inserted) = splice_under_heading(&existing, heading, entry, id)?;
        replace_contents(path, &updated)?;
        Ok(inserted)
    }

    /* ------------------------------- I/O ------------------------------- */

    fn is_blank(line: &str) -> bool {
        line.trim().is_empty()
    }

    fn read_optional(path: &Path) -> Result<Option<String>, BridgeError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BridgeError::io(path, err)),
        }
    }

    fn ensure_parent_dir(path: &Path) -> Result<(), BridgeError> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|e| BridgeError::io(dir, e))
            }
            _ => Ok(()),
        }
    }

    /// Path the rewrite must land on: symlinks are followed so the link survives.
    fn write_target(path: &Path) -> PathBuf {
        match fs::canonicalize(path) {
            Ok(resolved) => resolved,
            Err(_) => match fs::read_link(path) {
                Ok(link) => match path.parent() {
                    Some(dir) => dir.join(link),
                    None => link,
                },
                Err(_) => path.to_path_buf(),
            },
        }
    }

    /// Write through a temp file next to the target and rename it over the target,
    /// so readers see either the old or the new content.
    fn replace_contents(path: &Path, contents: &str) -> Result<(), BridgeError> {
        let target = write_target(path);
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| BridgeError::io(dir, e))?;
        tmp.write_all(contents.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| BridgeError::io(&target, e))?;
        if let Ok(meta) = fs::metadata(&target) {
            fs::set_permissions(tmp.path(), meta.permissions())
                .map_err(|e| BridgeError::io(&target, e))?;
        }
        tmp.persist(&target)
            .map_err(|e| BridgeError::io(&target, e.error))?;
        Ok(())
    }

}

pub mod filing {
    //! The render-and-insert operation handed to the request layer.

    use crate::model::{BridgeError, TodoEntry};
    use crate::ids::IdGenerator;
    use crate::insert::{Inserted, Placement, append_entry, insert_under_heading};
    use crate::render::render_entry;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FiledEntry {
        pub id: String,
        /// Exact block written to the file.
        pub text: String,
        pub placement: Placement,
        pub path: PathBuf,
    }

    /// Render `entry` with a fresh ID and file it into `path`: under `entry.heading`
    /// when one is given, otherwise at end of file.
    pub fn file_entry(
        entry: &TodoEntry,
        path: &Path,
        ids: &impl IdGenerator,
    ) -> Result<FiledEntry, BridgeError> {
        let id = ids.generate();
        // Rendered up front so bad input fails before any I/O.
        let canonical = render_entry(entry, 1, &id)?;

        let heading = entry
            .heading
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        let Inserted { text, placement } = match heading {
            None => {
                let placement = append_entry(path, &canonical)?;
                Inserted {
                    text: canonical,
                    placement,
                }
            }
            Some(name) => insert_under_heading(path, name, entry, &id)?,
        };
        log::debug!("filed {id} into {:?} as {:?}", path, placement);

        Ok(FiledEntry {
            id,
            text,
            placement,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ids::testing::SequenceIds;
        use std::fs;

        #[test]
        fn plain_append_returns_written_text_and_id() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("inbox.org");
            let ids = SequenceIds::default();

            let filed = file_entry(&TodoEntry::new("new"), &path, &ids).expect("file");

            assert_eq!(filed.id, "id-1");
            assert_eq!(filed.text, "* TODO new\n:PROPERTIES:\n:ID: id-1\n:END:");
            assert_eq!(filed.placement, Placement::Created);
            assert_eq!(fs::read_to_string(&path).expect("read"), format!("{}\n", filed.text));
        }

        #[test]
        fn heading_uses_same_id_at_deeper_level() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("todo.org");
            fs::write(&path, "* Work\n").expect("seed");
            let ids = SequenceIds::default();
            let mut entry = TodoEntry::new("new");
            entry.heading = Some("Work".into());

            let filed = file_entry(&entry, &path, &ids).expect("file");

            assert_eq!(filed.text, "** TODO new\n:PROPERTIES:\n:ID: id-1\n:END:");
            assert_eq!(filed.placement, Placement::UnderHeading { level: 1, line: 2 });
        }

        #[test]
        fn blank_heading_means_plain_append() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("inbox.org");
            fs::write(&path, "* TODO old").expect("seed");
            let mut entry = TodoEntry::new("new");
            entry.heading = Some("   ".into());

            let filed = file_entry(&entry, &path, &SequenceIds::default()).expect("file");

            assert_eq!(filed.placement, Placement::Appended);
            assert!(
                fs::read_to_string(&path)
                    .expect("read")
                    .starts_with("* TODO old\n\n* TODO new\n")
            );
        }

        #[test]
        fn every_call_gets_a_new_id() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("inbox.org");
            let ids = crate::ids::UuidGenerator;
            let entry = TodoEntry::new("same");

            let a = file_entry(&entry, &path, &ids).expect("first");
            let b = file_entry(&entry, &path, &ids).expect("second");
            assert_ne!(a.id, b.id);
        }
    }
}

pub mod config {
    //! Server configuration, read from the environment.

    use crate::model::BridgeError;
    use std::path::{Component, Path, PathBuf};

    pub const ORG_FILES_DIR_VAR: &str = "ORG_FILES_DIR";
    pub const INBOX_FILE_VAR: &str = "ORG_INBOX_FILE";
    pub const API_KEY_VAR: &str = "ORG_BRIDGE_API_KEY";
    pub const DEFAULT_INBOX_FILE: &str = "inbox.txt";

    fn default_org_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("org")
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BridgeConfig {
        /// Root directory all target files live under.
        pub org_dir: PathBuf,
        /// File used when a request names none.
        pub inbox_file: String,
    }

    impl Default for BridgeConfig {
        fn default() -> Self {
            Self {
                org_dir: default_org_dir(),
                inbox_file: DEFAULT_INBOX_FILE.to_string(),
            }
        }
    }

    impl BridgeConfig {
        pub fn from_env() -> Self {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        /// Build from an arbitrary variable lookup; empty values count as unset.
        pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
            let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
            let defaults = Self::default();
            Self {
                org_dir: get(ORG_FILES_DIR_VAR)
                    .map(PathBuf::from)
                    .unwrap_or(defaults.org_dir),
                inbox_file: get(INBOX_FILE_VAR).unwrap_or(defaults.inbox_file),
            }
        }

        pub fn with_org_dir(mut self, org_dir: impl Into<PathBuf>) -> Self {
            self.org_dir = org_dir.into();
            self
        }

        pub fn inbox_path(&self) -> PathBuf {
            self.org_dir.join(&self.inbox_file)
        }

        pub fn org_dir_exists(&self) -> bool {
            self.org_dir.is_dir()
        }

        /// Target path for a request's `file_name`; blank names go to the inbox.
        /// Names must stay inside `org_dir` (subdirectories are fine).
        pub fn resolve_file(&self, file_name: Option<&str>) -> Result<PathBuf, BridgeError> {
            let Some(name) = file_name.map(str::trim).filter(|n| !n.is_empty()) else {
                return Ok(self.inbox_path());
            };
            let rel = Path::new(name);
            let escapes = rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(BridgeError::Validation(format!(
                    "file name {name:?} must be relative to the org directory"
                )));
            }
            Ok(self.org_dir.join(rel))
        }
    }

}

pub mod request {
    //! Request layer: the JSON payload automation tools send, its validation, and
    //! the `OrgBridge` façade that files validated entries.

    use crate::config::BridgeConfig;
    use crate::model::{
        BridgeError, PlanningTime, Recurrence, RecurringField, RepeatType, RepeatUnit, TodoEntry,
    };
    use crate::filing::file_entry;
    use crate::ids::{IdGenerator, UuidGenerator};
    use crate::insert::Placement;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::{
        NoneAsEmptyString, PickFirst, StringWithSeparator, formats::CommaSeparator, serde_as,
    };

    fn default_state() -> String {
        "TODO".to_string()
    }

    fn default_repeat_every() -> u32 {
        1
    }

    fn default_repeat_unit() -> String {
        "days".to_string()
    }

    fn default_repeat_type() -> String {
        "standard".to_string()
    }

    fn default_recurring_field() -> String {
        "scheduled".to_string()
    }

    /// Payload for creating a TODO. Empty strings count as absent.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    pub struct CreateTodoRequest {
        pub title: String,
        #[serde(default = "default_state")]
        pub state: String,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub priority: Option<String>,
        /// A list, or one comma-separated string.
        #[serde_as(as = "PickFirst<(_, StringWithSeparator::<CommaSeparator, String>)>")]
        #[serde(default)]
        pub tags: Vec<String>,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub scheduled: Option<String>,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub deadline: Option<String>,
        #[serde(default)]
        pub include_scheduled_time: bool,
        #[serde(default)]
        pub include_deadline_time: bool,
        #[serde(default)]
        pub is_recurring: bool,
        #[serde(default = "default_repeat_every")]
        pub repeat_every: u32,
        #[serde(default = "default_repeat_unit")]
        pub repeat_unit: String,
        #[serde(default = "default_repeat_type")]
        pub repeat_type: String,
        #[serde(default = "default_recurring_field")]
        pub recurring_field: String,
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub body: Option<String>,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub file_name: Option<String>,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub heading: Option<String>,
    }

    impl CreateTodoRequest {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                state: default_state(),
                priority: None,
                tags: vec![],
                scheduled: None,
                deadline: None,
                include_scheduled_time: false,
                include_deadline_time: false,
                is_recurring: false,
                repeat_every: default_repeat_every(),
                repeat_unit: default_repeat_unit(),
                repeat_type: default_repeat_type(),
                recurring_field: default_recurring_field(),
                properties: IndexMap::new(),
                body: None,
                file_name: None,
                heading: None,
            }
        }

        /// Validate and convert into a renderable entry. Timestamps are checked by the renderer.
        pub fn into_entry(self) -> Result<TodoEntry, BridgeError> {
            let title = self.title.trim();
            if title.is_empty() {
                return Err(invalid("title must not be empty"));
            }
            single_line("title", title)?;

            let state = match self.state.trim() {
                "" => default_state(),
                s if s.contains(char::is_whitespace) => {
                    return Err(invalid(format!("state {s:?} must be a single word")));
                }
                s => s.to_string(),
            };

            let priority = non_blank(self.priority);
            if let Some(p) = &priority {
                if p.contains(|c: char| c.is_whitespace() || c == '[' || c == ']') {
                    return Err(invalid(format!("priority {p:?} is not a priority cookie")));
                }
            }

            let mut tags = Vec::with_capacity(self.tags.len());
            for tag in self.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
                if tag.contains(|c: char| c.is_whitespace() || c == ':') {
                    return Err(invalid(format!("tag {tag:?} may not contain spaces or colons")));
                }
                tags.push(tag.to_string());
            }

            let mut properties = IndexMap::with_capacity(self.properties.len());
            for (key, value) in &self.properties {
                let key = key.trim();
                if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == ':') {
                    return Err(invalid(format!("property key {key:?} is not valid")));
                }
                if value.contains('\n') {
                    return Err(invalid(format!("property {key:?} must be a single line")));
                }
                properties.insert(key.to_string(), value.trim().to_string());
            }

            let recurrence = if self.is_recurring {
                if self.repeat_every == 0 {
                    return Err(invalid("repeat_every must be at least 1"));
                }
                let field = RecurringField::from_name(&self.recurring_field).ok_or_else(|| {
                    invalid(format!(
                        "recurring_field {:?} must be \"scheduled\" or \"deadline\"",
                        self.recurring_field
                    ))
                })?;
                let recurrence = Recurrence {
                    every: self.repeat_every,
                    unit: RepeatUnit::from_name(&self.repeat_unit),
                    kind: RepeatType::from_name(&self.repeat_type),
                };
                Some((field, recurrence))
            } else {
                None
            };
            let recurrence_for = |field: RecurringField| {
                recurrence
                    .filter(|(target, _)| *target == field)
                    .map(|(_, r)| r)
            };

            let heading = non_blank(self.heading);
            if let Some(heading) = &heading {
                single_line("heading", heading)?;
            }

            let scheduled = non_blank(self.scheduled).map(|value| PlanningTime {
                value,
                include_time: self.include_scheduled_time,
                recurrence: recurrence_for(RecurringField::Scheduled),
            });
            let deadline = non_blank(self.deadline).map(|value| PlanningTime {
                value,
                include_time: self.include_deadline_time,
                recurrence: recurrence_for(RecurringField::Deadline),
            });

            Ok(TodoEntry {
                title: title.to_string(),
                state,
                priority,
                tags,
                scheduled,
                deadline,
                properties,
                body: non_blank(self.body),
                heading,
            })
        }
    }

    fn non_blank(value: Option<String>) -> Option<String> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn single_line(field: &str, value: &str) -> Result<(), BridgeError> {
        if value.contains(['\n', '\r']) {
            return Err(invalid(format!("{field} must be a single line")));
        }
        Ok(())
    }

    fn invalid(msg: impl Into<String>) -> BridgeError {
        BridgeError::Validation(msg.into())
    }

    /// Response for a filed TODO.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CreatedTodo {
        pub id: String,
        pub title: String,
        pub state: String,
        pub priority: Option<String>,
        pub tags: Vec<String>,
        pub scheduled: Option<String>,
        pub deadline: Option<String>,
        pub heading: Option<String>,
        pub file_path: String,
        /// Exact text block written.
        pub text: String,
        #[serde(skip)]
        pub placement: Placement,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct StatusReport {
        pub message: String,
        pub version: String,
        pub org_files_dir: String,
        pub healthy: bool,
    }

    /// Files validated requests into the configured org directory.
    #[derive(Debug, Clone)]
    pub struct OrgBridge<G = UuidGenerator> {
        config: BridgeConfig,
        ids: G,
    }

    impl OrgBridge {
        pub fn new(config: BridgeConfig) -> Self {
            Self::with_ids(config, UuidGenerator)
        }
    }

    impl<G: IdGenerator> OrgBridge<G> {
        pub fn with_ids(config: BridgeConfig, ids: G) -> Self {
            Self { config, ids }
        }

        pub fn config(&self) -> &BridgeConfig {
            &self.config
        }

        pub fn create_todo(&self, request: CreateTodoRequest) -> Result<CreatedTodo, BridgeError> {
            let file_name = request.file_name.clone();
            let entry = request.into_entry()?;
            if !self.config.org_dir_exists() {
                return Err(BridgeError::DirectoryNotFound(self.config.org_dir.clone()));
            }
            let path = self.config.resolve_file(file_name.as_deref())?;

            let filed = file_entry(&entry, &path, &self.ids)?;
            log::info!("created {} in {}", filed.id, path.display());

            Ok(CreatedTodo {
                id: filed.id,
                title: entry.title,
                state: entry.state,
                priority: entry.priority,
                tags: entry.tags,
                scheduled: entry.scheduled.map(|t| t.value),
                deadline: entry.deadline.map(|t| t.value),
                heading: entry.heading,
                file_path: filed.path.display().to_string(),
                text: filed.text,
                placement: filed.placement,
            })
        }

        pub fn status(&self) -> StatusReport {
            StatusReport {
                message: "Org-Bridge API Server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                org_files_dir: self.config.org_dir.display().to_string(),
                healthy: self.config.org_dir_exists(),
            }
        }
    }

}

pub use filing::file_entry;
pub use request::{CreateTodoRequest, CreatedTodo, OrgBridge};
