use async_graphql::{
    ComplexObject, Context, EmptySubscription, Enum, ErrorExtensions, InputObject,
    InputValueError, InputValueResult, Object, Scalar, ScalarType, Schema, SimpleObject, Value,
    ID,
};
use subject_registry_api::{AuthContext, SubjectRegistryApi};
use subject_registry_core::{
    BirthDate, OrderByClause, PageRequest, PaginatorInfo, RegistryError, SortOrder, Subject,
    SubjectId, SubjectInput, SubjectOrderColumn, SubjectPatch, User,
};
use time::{OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

pub type RegistrySchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

#[must_use]
pub fn build_schema(api: SubjectRegistryApi) -> RegistrySchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription).data(api).finish()
}

/// `YYYY-MM-DD HH:MM:SS` in UTC. Inputs may omit the time part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime(PrimitiveDateTime);

impl DateTime {
    fn birth_date(self) -> BirthDate {
        BirthDate::from(self.0.date())
    }
}

impl From<BirthDate> for DateTime {
    fn from(date: BirthDate) -> Self {
        Self(PrimitiveDateTime::new(date.date(), Time::MIDNIGHT))
    }
}

impl From<OffsetDateTime> for DateTime {
    fn from(value: OffsetDateTime) -> Self {
        let utc = value.to_offset(UtcOffset::UTC);
        Self(PrimitiveDateTime::new(utc.date(), utc.time()))
    }
}

#[Scalar(name = "DateTime")]
impl ScalarType for DateTime {
    fn parse(value: Value) -> InputValueResult<Self> {
        let Value::String(raw) = &value else {
            return Err(InputValueError::expected_type(value));
        };
        BirthDate::parse(raw).map(Self::from).map_err(|err| InputValueError::custom(err.to_string()))
    }

    fn to_value(&self) -> Value {
        Value::String(format!(
            "{} {:02}:{:02}:{:02}",
            BirthDate::from(self.0.date()),
            self.0.hour(),
            self.0.minute(),
            self.0.second()
        ))
    }
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(name = "Subject", complex, rename_fields = "snake_case")]
pub struct SubjectNode {
    #[graphql(skip)]
    subject_id: SubjectId,
    id: ID,
    name: String,
    test_chamber: i32,
    date_of_birth: DateTime,
    score: i32,
    alive: bool,
    created_at: DateTime,
    updated_at: DateTime,
}

#[ComplexObject(rename_fields = "snake_case")]
impl SubjectNode {
    /// Accounts that own this subject.
    async fn users(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<UserNode>> {
        let api = ctx.data::<SubjectRegistryApi>()?;
        let owners = api.subject_owners(self.subject_id).map_err(resolver_error)?;
        Ok(owners.into_iter().map(UserNode::from).collect())
    }
}

impl From<Subject> for SubjectNode {
    fn from(subject: Subject) -> Self {
        Self {
            subject_id: subject.id,
            id: ID(subject.id.to_string()),
            name: subject.name,
            test_chamber: subject.test_chamber,
            date_of_birth: DateTime::from(subject.date_of_birth),
            score: subject.score,
            alive: subject.alive,
            created_at: DateTime::from(subject.created_at),
            updated_at: DateTime::from(subject.updated_at),
        }
    }
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(name = "User", rename_fields = "snake_case")]
pub struct UserNode {
    id: ID,
    name: String,
    email: String,
    created_at: DateTime,
}

impl From<User> for UserNode {
    fn from(user: User) -> Self {
        Self {
            id: ID(user.id.to_string()),
            name: user.name,
            email: user.email,
            created_at: DateTime::from(user.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[graphql(name = "SubjectColumn")]
pub enum SubjectColumn {
    Id,
    Name,
    TestChamber,
    DateOfBirth,
    Score,
    Alive,
    CreatedAt,
}

impl From<SubjectColumn> for SubjectOrderColumn {
    fn from(column: SubjectColumn) -> Self {
        match column {
            SubjectColumn::Id => Self::Id,
            SubjectColumn::Name => Self::Name,
            SubjectColumn::TestChamber => Self::TestChamber,
            SubjectColumn::DateOfBirth => Self::DateOfBirth,
            SubjectColumn::Score => Self::Score,
            SubjectColumn::Alive => Self::Alive,
            SubjectColumn::CreatedAt => Self::CreatedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[graphql(name = "SortOrder")]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, InputObject)]
#[graphql(name = "OrderByClause")]
pub struct OrderByInput {
    column: SubjectColumn,
    order: Option<Order>,
}

impl From<&OrderByInput> for OrderByClause {
    fn from(input: &OrderByInput) -> Self {
        let order = match input.order {
            Some(Order::Desc) => SortOrder::Desc,
            Some(Order::Asc) | None => SortOrder::Asc,
        };
        OrderByClause::new(input.column.into(), order)
    }
}

fn order_clauses(order_by: Option<&[OrderByInput]>) -> Vec<OrderByClause> {
    order_by.unwrap_or_default().iter().map(OrderByClause::from).collect()
}

#[derive(Debug, Clone, SimpleObject)]
#[graphql(name = "PaginatorInfo")]
pub struct PaginatorInfoNode {
    count: u64,
    current_page: u32,
    first_item: Option<u64>,
    last_item: Option<u64>,
    has_more_pages: bool,
    last_page: u32,
    per_page: u32,
    total: u64,
}

impl From<PaginatorInfo> for PaginatorInfoNode {
    fn from(info: PaginatorInfo) -> Self {
        Self {
            count: info.count,
            current_page: info.current_page,
            first_item: info.first_item,
            last_item: info.last_item,
            has_more_pages: info.has_more_pages,
            last_page: info.last_page,
            per_page: info.per_page,
            total: info.total,
        }
    }
}

#[derive(Debug, Clone, SimpleObject)]
pub struct SubjectPaginator {
    data: Vec<SubjectNode>,
    paginator_info: PaginatorInfoNode,
}

fn resolver_error(err: anyhow::Error) -> async_graphql::Error {
    let (category, message) = match err.downcast_ref::<RegistryError>() {
        Some(RegistryError::Validation(_)) => ("validation", err.to_string()),
        Some(RegistryError::Unauthenticated(_)) => ("authentication", err.to_string()),
        Some(RegistryError::NotFound(_)) => ("not_found", err.to_string()),
        Some(RegistryError::Conflict(_)) => ("conflict", err.to_string()),
        None => {
            tracing::error!(error = %format!("{err:#}"), "graphql resolver failed");
            ("internal", "Internal server error".to_string())
        }
    };
    async_graphql::Error::new(message).extend_with(|_, extensions| extensions.set("category", category))
}

fn parse_subject_id(id: &ID) -> async_graphql::Result<SubjectId> {
    id.parse::<SubjectId>().map_err(|err| resolver_error(err.into()))
}

fn auth<'a>(ctx: &Context<'a>) -> async_graphql::Result<&'a AuthContext> {
    ctx.data_opt::<AuthContext>().ok_or_else(|| {
        resolver_error(RegistryError::Unauthenticated("Unauthenticated.".to_string()).into())
    })
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Every subject, ordered by `orderBy` and then by id.
    async fn subjects(
        &self,
        ctx: &Context<'_>,
        order_by: Option<Vec<OrderByInput>>,
    ) -> async_graphql::Result<Vec<SubjectNode>> {
        auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let subjects =
            api.list_subjects(&order_clauses(order_by.as_deref())).map_err(resolver_error)?;
        Ok(subjects.into_iter().map(SubjectNode::from).collect())
    }

    async fn subjects_page(
        &self,
        ctx: &Context<'_>,
        #[graphql(default = 10)] first: u32,
        #[graphql(default = 1)] page: u32,
        order_by: Option<Vec<OrderByInput>>,
    ) -> async_graphql::Result<SubjectPaginator> {
        auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let page = api
            .page_subjects(&order_clauses(order_by.as_deref()), PageRequest::new(page, first))
            .map_err(resolver_error)?;
        Ok(SubjectPaginator {
            data: page.data.into_iter().map(SubjectNode::from).collect(),
            paginator_info: page.paginator_info.into(),
        })
    }

    async fn subject(&self, ctx: &Context<'_>, id: ID) -> async_graphql::Result<Option<SubjectNode>> {
        auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let subject = api.get_subject(parse_subject_id(&id)?).map_err(resolver_error)?;
        Ok(subject.map(SubjectNode::from))
    }

    /// Subjects owned by the authenticated caller.
    async fn me_subjects(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<SubjectNode>> {
        let caller = auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let subjects = api.my_subjects(caller).map_err(resolver_error)?;
        Ok(subjects.into_iter().map(SubjectNode::from).collect())
    }
}

pub struct MutationRoot;

#[Object(rename_args = "snake_case")]
impl MutationRoot {
    /// Create the subject named `name`, or overwrite it when it already exists.
    async fn create_subject(
        &self,
        ctx: &Context<'_>,
        name: String,
        date_of_birth: DateTime,
        test_chamber: i32,
        score: i32,
        alive: bool,
    ) -> async_graphql::Result<SubjectNode> {
        let caller = auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let input = SubjectInput {
            name,
            test_chamber,
            date_of_birth: date_of_birth.birth_date(),
            score,
            alive,
        };
        let outcome = api.create_subject(caller, input).map_err(resolver_error)?;
        Ok(outcome.subject.into())
    }

    async fn update_subject(
        &self,
        ctx: &Context<'_>,
        id: ID,
        name: Option<String>,
        date_of_birth: Option<DateTime>,
        test_chamber: Option<i32>,
        score: Option<i32>,
        alive: Option<bool>,
    ) -> async_graphql::Result<SubjectNode> {
        let caller = auth(ctx)?;
        let api = ctx.data::<SubjectRegistryApi>()?;
        let patch = SubjectPatch {
            name,
            test_chamber,
            date_of_birth: date_of_birth.map(DateTime::birth_date),
            score,
            alive,
        };
        let subject =
            api.update_subject(caller, parse_subject_id(&id)?, &patch).map_err(resolver_error)?;
        Ok(subject.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_graphql::{Request, Variables};
    use subject_registry_api::{LoginRequest, RegisterUserRequest};

    fn unique_temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("subject-registry-graphql-{}.sqlite3", ulid::Ulid::new()))
    }

    fn session(api: &SubjectRegistryApi) -> AuthContext {
        session_for(api, "glados@aperture.test")
    }

    fn session_for(api: &SubjectRegistryApi, email: &str) -> AuthContext {
        api.register_user(RegisterUserRequest {
            name: "GLaDOS".to_string(),
            email: email.to_string(),
            password: "neurotoxin-42".to_string(),
        })
        .unwrap_or_else(|err| panic!("register failed: {err}"));
        let issued = api
            .login(LoginRequest {
                email: email.to_string(),
                password: "neurotoxin-42".to_string(),
                device_name: None,
            })
            .unwrap_or_else(|err| panic!("login failed: {err}"));
        api.authenticate(&issued.access_token).unwrap_or_else(|err| panic!("auth failed: {err}"))
    }

    async fn run(schema: &RegistrySchema, request: Request) -> serde_json::Value {
        let response = schema.execute(request).await;
        assert!(response.errors.is_empty(), "unexpected graphql errors: {:?}", response.errors);
        response.data.into_json().unwrap_or_else(|err| panic!("graphql data is not JSON: {err}"))
    }

    const CREATE: &str = r"
        mutation CreateSubject($name: String!, $dateOfBirth: DateTime!, $testChamber: Int!, $score: Int!, $alive: Boolean!) {
          createSubject(name: $name, date_of_birth: $dateOfBirth, test_chamber: $testChamber, score: $score, alive: $alive) {
            id
            name
            date_of_birth
            test_chamber
          }
        }
    ";

    fn create_request(auth: &AuthContext, name: &str, dob: &str, chamber: i32) -> Request {
        Request::new(CREATE)
            .variables(Variables::from_json(serde_json::json!({
                "name": name,
                "dateOfBirth": dob,
                "testChamber": chamber,
                "score": 5,
                "alive": true
            })))
            .data(auth.clone())
    }

    #[tokio::test]
    async fn create_subject_mutation_upserts_and_returns_snake_case_fields() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let auth = session(&api);
        let schema = build_schema(api);

        let first = run(&schema, create_request(&auth, "Chell", "1988-04-11 00:00:00", 19)).await;
        let second = run(&schema, create_request(&auth, "Chell", "1988-04-11", 20)).await;

        let created = &first["createSubject"];
        assert_eq!(created["name"], "Chell");
        assert_eq!(created["date_of_birth"], "1988-04-11 00:00:00");
        assert_eq!(second["createSubject"]["id"], created["id"]);
        assert_eq!(second["createSubject"]["test_chamber"], 20);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn subjects_query_honours_order_by_and_exposes_owners() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let auth = session(&api);
        let schema = build_schema(api);
        run(&schema, create_request(&auth, "Chell", "1988-04-11", 19)).await;
        run(&schema, create_request(&auth, "Cave Johnson", "1925-06-15", 0)).await;

        let query = r"{
            subjects(orderBy: [{column: DATE_OF_BIRTH, order: ASC}]) {
              name
              users { email }
            }
        }";
        let data = run(&schema, Request::new(query).data(auth.clone())).await;
        assert_eq!(data["subjects"][0]["name"], "Cave Johnson");
        assert_eq!(data["subjects"][1]["name"], "Chell");
        assert_eq!(data["subjects"][0]["users"][0]["email"], "glados@aperture.test");

        let query = r"{
            subjectsPage(first: 1, page: 2, orderBy: [{column: TEST_CHAMBER, order: DESC}]) {
              data { name }
              paginatorInfo { currentPage lastPage total hasMorePages }
            }
        }";
        let data = run(&schema, Request::new(query).data(auth)).await;
        assert_eq!(data["subjectsPage"]["data"][0]["name"], "Cave Johnson");
        assert_eq!(data["subjectsPage"]["paginatorInfo"]["lastPage"], 2);
        assert_eq!(data["subjectsPage"]["paginatorInfo"]["hasMorePages"], false);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn resolvers_reject_anonymous_callers_and_categorise_errors() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let auth = session(&api);
        let schema = build_schema(api);

        let anonymous = schema.execute(Request::new("{ subjects { id } }")).await;
        let message = anonymous.errors.first().map(|err| err.message.clone()).unwrap_or_default();
        assert!(message.contains("Unauthenticated"), "unexpected message: {message}");

        let missing = schema
            .execute(
                Request::new(r#"mutation { updateSubject(id: "404", score: 1) { id } }"#)
                    .data(auth),
            )
            .await;
        let category = missing
            .errors
            .first()
            .and_then(|err| err.extensions.as_ref())
            .and_then(|extensions| extensions.get("category"))
            .cloned();
        assert_eq!(category, Some(Value::from("not_found")));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_subject_mutation_merges_snake_case_arguments() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let auth = session(&api);
        let schema = build_schema(api);
        let created = run(&schema, create_request(&auth, "Chell", "1988-04-11", 19)).await;
        let id = created["createSubject"]["id"].clone();

        let mutation = r#"
            mutation UpdateSubject($id: ID!) {
              updateSubject(id: $id, date_of_birth: "1990-01-02", test_chamber: 7) {
                id
                name
                date_of_birth
                test_chamber
                score
                alive
              }
            }
        "#;
        let data = run(
            &schema,
            Request::new(mutation)
                .variables(Variables::from_json(serde_json::json!({ "id": id })))
                .data(auth),
        )
        .await;

        let updated = &data["updateSubject"];
        assert_eq!(updated["id"], id);
        assert_eq!(updated["name"], "Chell");
        assert_eq!(updated["date_of_birth"], "1990-01-02 00:00:00");
        assert_eq!(updated["test_chamber"], 7);
        assert_eq!(updated["score"], 5);
        assert_eq!(updated["alive"], true);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn subject_query_resolves_unknown_id_to_null() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let auth = session(&api);
        let schema = build_schema(api);
        let created = run(&schema, create_request(&auth, "Chell", "1988-04-11", 19)).await;
        let id = created["createSubject"]["id"].clone();

        let data = run(&schema, Request::new(r#"{ subject(id: "404") { id name } }"#).data(auth.clone()))
            .await;
        assert!(data["subject"].is_null(), "unknown id should resolve to null: {data}");

        let found = run(
            &schema,
            Request::new("query Subject($id: ID!) { subject(id: $id) { name } }")
                .variables(Variables::from_json(serde_json::json!({ "id": id })))
                .data(auth),
        )
        .await;
        assert_eq!(found["subject"]["name"], "Chell");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn me_subjects_lists_only_the_callers_subjects() {
        let path = unique_temp_db_path();
        let api = SubjectRegistryApi::new(path.clone());
        let glados = session_for(&api, "glados@aperture.test");
        let wheatley = session_for(&api, "wheatley@aperture.test");
        let schema = build_schema(api);
        run(&schema, create_request(&glados, "Chell", "1988-04-11", 19)).await;
        run(&schema, create_request(&wheatley, "Doug Rattmann", "1961-09-02", 4)).await;

        let query = "{ meSubjects { name users { email } } }";
        let mine = run(&schema, Request::new(query).data(glados)).await;
        assert_eq!(mine["meSubjects"].as_array().map(Vec::len), Some(1));
        assert_eq!(mine["meSubjects"][0]["name"], "Chell");
        assert_eq!(mine["meSubjects"][0]["users"][0]["email"], "glados@aperture.test");

        let theirs = run(&schema, Request::new(query).data(wheatley)).await;
        assert_eq!(theirs["meSubjects"].as_array().map(Vec::len), Some(1));
        assert_eq!(theirs["meSubjects"][0]["name"], "Doug Rattmann");

        let _ = std::fs::remove_file(&path);
    }
}
