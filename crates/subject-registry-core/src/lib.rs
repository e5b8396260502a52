use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Date, Month, OffsetDateTime};

pub const MAX_NAME_LEN: usize = 255;
pub const DEFAULT_PER_PAGE: u32 = 10;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubjectId(pub i64);

impl Display for SubjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| RegistryError::Validation(format!("invalid subject id: {value}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TokenId(pub i64);

impl Display for TokenId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Calendar date of birth, exchanged as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BirthDate(Date);

impl BirthDate {
    /// Build a date from calendar components.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the components do not form a real date.
    pub fn from_calendar_date(year: i32, month: u8, day: u8) -> Result<Self, RegistryError> {
        let month = Month::try_from(month)
            .map_err(|err| RegistryError::Validation(format!("invalid month {month}: {err}")))?;
        Date::from_calendar_date(year, month, day)
            .map(Self)
            .map_err(|err| RegistryError::Validation(format!("invalid date of birth: {err}")))
    }

    /// Parse `YYYY-MM-DD`. A trailing time component (`YYYY-MM-DD HH:MM:SS`
    /// or an RFC 3339 `T` suffix) is accepted and discarded.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for anything that is not a valid calendar date.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let invalid = || {
            RegistryError::Validation(format!("date_of_birth MUST be formatted as YYYY-MM-DD: {value}"))
        };

        let date_part = value.trim().split([' ', 'T']).next().unwrap_or_default();
        let mut parts = date_part.splitn(3, '-');
        let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }

        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        let day = day.parse::<u8>().map_err(|_| invalid())?;
        Self::from_calendar_date(year, month, day)
    }

    #[must_use]
    pub fn date(self) -> Date {
        self.0
    }
}

impl Display for BirthDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.0.year(), u8::from(self.0.month()), self.0.day())
    }
}

impl From<Date> for BirthDate {
    fn from(date: Date) -> Self {
        Self(date)
    }
}

impl FromStr for BirthDate {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for BirthDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BirthDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    pub test_chamber: i32,
    pub date_of_birth: BirthDate,
    pub score: i32,
    pub alive: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Ownership link between one user and one subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSubject {
    pub id: i64,
    pub user_id: UserId,
    pub subject_id: SubjectId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectInput {
    pub name: String,
    #[serde(deserialize_with = "lenient::int")]
    pub test_chamber: i32,
    pub date_of_birth: BirthDate,
    #[serde(deserialize_with = "lenient::int")]
    pub score: i32,
    #[serde(deserialize_with = "lenient::flag")]
    pub alive: bool,
}

impl SubjectInput {
    /// Validate one create-or-update payload.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the name is blank or too long,
    /// or the test chamber is negative.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("name MUST be provided".to_string()));
        }

        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(RegistryError::Validation(format!(
                "name MUST be at most {MAX_NAME_LEN} characters"
            )));
        }

        if self.test_chamber < 0 {
            return Err(RegistryError::Validation("test_chamber MUST be >= 0".to_string()));
        }

        Ok(())
    }

    /// Trim the name and validate the result.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when [`SubjectInput::validate`] fails.
    pub fn normalized(mut self) -> Result<Self, RegistryError> {
        self.name = self.name.trim().to_string();
        self.validate()?;
        Ok(self)
    }
}

/// Partial edit of an existing subject. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::optional_int")]
    pub test_chamber: Option<i32>,
    #[serde(default)]
    pub date_of_birth: Option<BirthDate>,
    #[serde(default, deserialize_with = "lenient::optional_int")]
    pub score: Option<i32>,
    #[serde(default, deserialize_with = "lenient::optional_flag")]
    pub alive: Option<bool>,
}

impl SubjectPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.test_chamber.is_none()
            && self.date_of_birth.is_none()
            && self.score.is_none()
            && self.alive.is_none()
    }

    /// Merge this patch over `current`.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the merged record is invalid.
    pub fn apply(&self, current: &Subject) -> Result<SubjectInput, RegistryError> {
        SubjectInput {
            name: self.name.clone().unwrap_or_else(|| current.name.clone()),
            test_chamber: self.test_chamber.unwrap_or(current.test_chamber),
            date_of_birth: self.date_of_birth.unwrap_or(current.date_of_birth),
            score: self.score.unwrap_or(current.score),
            alive: self.alive.unwrap_or(current.alive),
        }
        .normalized()
    }
}

/// Form posts carry every field as a string, so numbers and flags are read
/// from either their JSON type or a string holding one.
mod lenient {
    use std::fmt::Formatter;

    use serde::de::{Error, Unexpected, Visitor};
    use serde::{Deserialize, Deserializer};

    struct IntVisitor;

    impl Visitor<'_> for IntVisitor {
        type Value = i32;

        fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            f.write_str("an integer or a string holding one")
        }

        fn visit_i64<E: Error>(self, value: i64) -> Result<i32, E> {
            i32::try_from(value).map_err(|_| E::invalid_value(Unexpected::Signed(value), &self))
        }

        fn visit_u64<E: Error>(self, value: u64) -> Result<i32, E> {
            i32::try_from(value).map_err(|_| E::invalid_value(Unexpected::Unsigned(value), &self))
        }

        fn visit_str<E: Error>(self, value: &str) -> Result<i32, E> {
            value.trim().parse().map_err(|_| E::invalid_value(Unexpected::Str(value), &self))
        }
    }

    struct FlagVisitor;

    impl Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            f.write_str("a boolean, 0/1, or one of \"true\", \"false\", \"on\", \"off\"")
        }

        fn visit_bool<E: Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_i64<E: Error>(self, value: i64) -> Result<bool, E> {
            match value {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(Unexpected::Signed(value), &self)),
            }
        }

        fn visit_u64<E: Error>(self, value: u64) -> Result<bool, E> {
            match value {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(Unexpected::Unsigned(value), &self)),
            }
        }

        fn visit_str<E: Error>(self, value: &str) -> Result<bool, E> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(true),
                "0" | "false" | "off" => Ok(false),
                _ => Err(E::invalid_value(Unexpected::Str(value), &self)),
            }
        }
    }

    pub(crate) fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        deserializer.deserialize_any(IntVisitor)
    }

    pub(crate) fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        deserializer.deserialize_any(FlagVisitor)
    }

    #[derive(Deserialize)]
    struct LenientInt(#[serde(deserialize_with = "int")] i32);

    #[derive(Deserialize)]
    struct LenientFlag(#[serde(deserialize_with = "flag")] bool);

    pub(crate) fn optional_int<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i32>, D::Error> {
        Ok(Option::<LenientInt>::deserialize(deserializer)?.map(|LenientInt(value)| value))
    }

    pub(crate) fn optional_flag<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<bool>, D::Error> {
        Ok(Option::<LenientFlag>::deserialize(deserializer)?.map(|LenientFlag(value)| value))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubjectOrderColumn {
    Id,
    Name,
    TestChamber,
    DateOfBirth,
    Score,
    Alive,
    CreatedAt,
}

impl SubjectOrderColumn {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::TestChamber => "test_chamber",
            Self::DateOfBirth => "date_of_birth",
            Self::Score => "score",
            Self::Alive => "alive",
            Self::CreatedAt => "created_at",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "id" => Some(Self::Id),
            "name" => Some(Self::Name),
            "test_chamber" => Some(Self::TestChamber),
            "date_of_birth" => Some(Self::DateOfBirth),
            "score" => Some(Self::Score),
            "alive" => Some(Self::Alive),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }

    fn compare(self, lhs: &Subject, rhs: &Subject) -> Ordering {
        match self {
            Self::Id => lhs.id.cmp(&rhs.id),
            Self::Name => lhs.name.cmp(&rhs.name),
            Self::TestChamber => lhs.test_chamber.cmp(&rhs.test_chamber),
            Self::DateOfBirth => lhs.date_of_birth.cmp(&rhs.date_of_birth),
            Self::Score => lhs.score.cmp(&rhs.score),
            Self::Alive => lhs.alive.cmp(&rhs.alive),
            Self::CreatedAt => lhs.created_at.cmp(&rhs.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrderByClause {
    pub column: SubjectOrderColumn,
    #[serde(default)]
    pub order: SortOrder,
}

impl OrderByClause {
    #[must_use]
    pub fn new(column: SubjectOrderColumn, order: SortOrder) -> Self {
        Self { column, order }
    }
}

fn compare_subjects(lhs: &Subject, rhs: &Subject, clauses: &[OrderByClause]) -> Ordering {
    clauses
        .iter()
        .map(|clause| {
            let ordering = clause.column.compare(lhs, rhs);
            match clause.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| lhs.id.cmp(&rhs.id))
}

/// Order subjects by the given clauses, falling back to ascending id for ties.
pub fn sort_subjects(subjects: &mut [Subject], clauses: &[OrderByClause]) {
    subjects.sort_by(|lhs, rhs| compare_subjects(lhs, rhs, clauses));
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, per_page: DEFAULT_PER_PAGE }
    }
}

impl PageRequest {
    #[must_use]
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    /// Clamp `page` to at least 1 and `per_page` into `1..=MAX_PER_PAGE`.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self { page: self.page.max(1), per_page: self.per_page.clamp(1, MAX_PER_PAGE) }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PaginatorInfo {
    pub count: u64,
    pub current_page: u32,
    pub first_item: Option<u64>,
    pub last_item: Option<u64>,
    pub has_more_pages: bool,
    pub last_page: u32,
    pub per_page: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectPage {
    pub data: Vec<Subject>,
    pub paginator_info: PaginatorInfo,
}

/// Cut one offset-based page out of an already ordered list.
#[must_use]
pub fn paginate(subjects: Vec<Subject>, request: PageRequest) -> SubjectPage {
    let request = request.normalized();
    let total = subjects.len() as u64;
    let per_page = u64::from(request.per_page);
    let last_page = u32::try_from(total.div_ceil(per_page).max(1)).unwrap_or(u32::MAX);
    let offset = u64::from(request.page - 1) * per_page;

    let data = subjects
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(request.per_page as usize)
        .collect::<Vec<_>>();
    let count = data.len() as u64;
    let (first_item, last_item) =
        if count == 0 { (None, None) } else { (Some(offset + 1), Some(offset + count)) };

    SubjectPage {
        data,
        paginator_info: PaginatorInfo {
            count,
            current_page: request.page,
            first_item,
            last_item,
            has_more_pages: request.page < last_page,
            last_page,
            per_page: request.per_page,
            total,
        },
    }
}
