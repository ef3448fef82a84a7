//! In-memory bank accounts app for driving the runner without a browser
//!
//! Renders a small element tree per page (sidenav, account list, new account
//! form) with the same `data-test` hooks, validation messages and network
//! calls as the real app. One [`SimApp`] plays the backend; every launched
//! [`SimDriver`] is a fresh browser context against it.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageOutputFormat, RgbaImage};
use parking_lot::Mutex;
use serde_json::Value;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use bankaccounts_e2e::config::HarnessConfig;
use bankaccounts_e2e::driver::{Driver, DriverLauncher, ElementState};
use bankaccounts_e2e::error::{E2eError, E2eResult};
use bankaccounts_e2e::fixtures::{FixtureService, SessionCookie, TestUser};
use bankaccounts_e2e::intercept::{NetworkEvent, Route, RoutePattern};
use bankaccounts_e2e::selector::{Selector, Target};
use bankaccounts_e2e::spec::{SuiteSpec, Viewport};

pub const APP_URL: &str = "http://localhost:3000";
pub const API_URL: &str = "http://localhost:3001";

const MOBILE_BREAKPOINT: u32 = 414;
const SESSION_COOKIE: &str = "connect.sid";

/// The shipped bank accounts suite
pub fn bankaccounts_suite() -> SuiteSpec {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs/bankaccounts.yaml");
    SuiteSpec::from_file(&path).unwrap()
}

/// Harness config with short timeouts, pointing at the simulated origins
pub fn config(output: &std::path::Path) -> HarnessConfig {
    let mut config = HarnessConfig {
        app_url: APP_URL.to_string(),
        api_url: API_URL.to_string(),
        output_dir: output.to_path_buf(),
        ..Default::default()
    };
    config.timeouts.command_ms = 500;
    config.timeouts.request_ms = 500;
    config.timeouts.poll_interval_ms = 10;
    config
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: String,
    pub bank_name: String,
    pub routing_number: String,
    pub account_number: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Network {
    Normal,
    /// The request is never sent
    Silent,
    /// The request is sent but never answered
    Hang,
}

#[derive(Default)]
struct Backend {
    accounts: Vec<Account>,
    next_id: u32,
    users: Vec<TestUser>,
    sessions: Vec<String>,
    seeds: usize,
    launches: Vec<Viewport>,
    closed: usize,
    silent: Vec<String>,
    hanging: Vec<String>,
    faults: Faults,
}

/// Regressions the app can be switched into
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    hard_delete: bool,
    submit_always_enabled: bool,
    lose_bridge_on_error: bool,
}

/// Shared backend state
#[derive(Clone, Default)]
pub struct SimApp {
    backend: Arc<Mutex<Backend>>,
}

impl SimApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixtures(&self) -> SimFixtures {
        SimFixtures { app: self.clone() }
    }

    pub fn launcher(&self) -> SimLauncher {
        SimLauncher { app: self.clone() }
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.backend.lock().accounts.clone()
    }

    pub fn seeds(&self) -> usize {
        self.backend.lock().seeds
    }

    pub fn launches(&self) -> Vec<Viewport> {
        self.backend.lock().launches.clone()
    }

    pub fn closed(&self) -> usize {
        self.backend.lock().closed
    }

    /// Requests with this method are never sent
    pub fn silence(&self, method: &str) {
        self.backend.lock().silent.push(method.to_ascii_uppercase());
    }

    /// Requests with this method never get a response
    pub fn hang(&self, method: &str) {
        self.backend.lock().hanging.push(method.to_ascii_uppercase());
    }

    /// Deleting removes the account instead of flagging it
    pub fn hard_delete(&self) {
        self.backend.lock().faults.hard_delete = true;
    }

    /// The form never disables its submit button
    pub fn submit_always_enabled(&self) {
        self.backend.lock().faults.submit_always_enabled = true;
    }

    /// A failed action takes the browser down with it
    pub fn lose_bridge_on_error(&self) {
        self.backend.lock().faults.lose_bridge_on_error = true;
    }

    fn faults(&self) -> Faults {
        self.backend.lock().faults
    }

    fn network(&self, method: &str) -> Network {
        let backend = self.backend.lock();
        let method = method.to_ascii_uppercase();
        if backend.silent.contains(&method) {
            Network::Silent
        } else if backend.hanging.contains(&method) {
            Network::Hang
        } else {
            Network::Normal
        }
    }

    fn has_session(&self, cookies: &[SessionCookie]) -> bool {
        let backend = self.backend.lock();
        cookies
            .iter()
            .any(|c| c.name == SESSION_COOKIE && backend.sessions.contains(&c.value))
    }

    fn create_account(&self, bank_name: &str, routing_number: &str, account_number: &str) {
        let mut backend = self.backend.lock();
        let id = format!("acc-{}", backend.next_id);
        backend.next_id += 1;
        backend.accounts.push(Account {
            id,
            bank_name: bank_name.to_string(),
            routing_number: routing_number.to_string(),
            account_number: account_number.to_string(),
            deleted: false,
        });
    }

    fn delete_account(&self, id: &str) {
        let mut backend = self.backend.lock();
        if backend.faults.hard_delete {
            backend.accounts.retain(|a| a.id != id);
        } else if let Some(account) = backend.accounts.iter_mut().find(|a| a.id == id) {
            account.deleted = true;
        }
    }
}

pub struct SimFixtures {
    app: SimApp,
}

#[async_trait]
impl FixtureService for SimFixtures {
    async fn seed(&self) -> E2eResult<()> {
        let mut backend = self.app.backend.lock();
        backend.accounts = vec![Account {
            id: "acc-1".to_string(),
            bank_name: "O'Hara - Labadie Bank".to_string(),
            routing_number: "315868124".to_string(),
            account_number: "697301328".to_string(),
            deleted: false,
        }];
        backend.next_id = 2;
        backend.users = vec![
            TestUser {
                id: "t45AiwidW".to_string(),
                username: "Katharina_Bernier".to_string(),
                first_name: Some("Edgar".to_string()),
                last_name: Some("Johns".to_string()),
            },
            TestUser {
                id: "qywYp6hS0U".to_string(),
                username: "Tavares_Barrows".to_string(),
                first_name: None,
                last_name: None,
            },
        ];
        backend.sessions.clear();
        backend.seeds += 1;
        Ok(())
    }

    async fn find_user(&self, username: Option<&str>) -> E2eResult<TestUser> {
        let backend = self.app.backend.lock();
        let user = match username {
            Some(name) => backend.users.iter().find(|u| u.username == name),
            None => backend.users.first(),
        };
        user.cloned()
            .ok_or_else(|| E2eError::Fixture(format!("no seeded user {:?}", username)))
    }

    async fn login(&self, user: &TestUser) -> E2eResult<Vec<SessionCookie>> {
        let session = format!("s:{}", user.id);
        self.app.backend.lock().sessions.push(session.clone());
        Ok(vec![SessionCookie {
            name: SESSION_COOKIE.to_string(),
            value: session,
            domain: None,
            path: None,
            url: Some(APP_URL.to_string()),
        }])
    }
}

pub struct SimLauncher {
    app: SimApp,
}

#[async_trait]
impl DriverLauncher for SimLauncher {
    async fn launch(&self, viewport: &Viewport) -> E2eResult<Box<dyn Driver>> {
        self.app.backend.lock().launches.push(*viewport);
        Ok(Box::new(SimDriver::new(self.app.clone(), *viewport)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Blank,
    Signin,
    Home,
    BankAccounts,
    NewBankAccount,
}

impl Page {
    fn path(&self) -> &'static str {
        match self {
            Page::Blank => "",
            Page::Signin => "/signin",
            Page::Home => "/",
            Page::BankAccounts => "/bankaccounts",
            Page::NewBankAccount => "/bankaccounts/new",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    SidenavToggle,
    NavBankAccounts,
    NewAccount,
    Field(usize),
    Submit,
    Delete(usize),
}

#[derive(Debug, Clone)]
struct Node {
    tag: &'static str,
    test: Option<String>,
    id: Option<String>,
    text: String,
    visible: bool,
    disabled: bool,
    value: Option<String>,
    control: Option<Control>,
    children: Vec<Node>,
}

impl Node {
    fn new(tag: &'static str) -> Self {
        Self {
            tag,
            test: None,
            id: None,
            text: String::new(),
            visible: true,
            disabled: false,
            value: None,
            control: None,
            children: Vec::new(),
        }
    }

    fn test(mut self, value: impl Into<String>) -> Self {
        self.test = Some(value.into());
        self
    }

    fn id(mut self, value: impl Into<String>) -> Self {
        self.id = Some(value.into());
        self
    }

    fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    fn hidden(mut self, hidden: bool) -> Self {
        self.visible = !hidden;
        self
    }

    fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    fn control(mut self, control: Control) -> Self {
        self.control = Some(control);
        self
    }

    fn child(mut self, node: Node) -> Self {
        self.children.push(node);
        self
    }

    fn text_content(&self) -> String {
        let mut parts = vec![self.text.clone()];
        parts.extend(self.children.iter().map(Node::text_content));
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    fn matches(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Sel(v) => self.test.as_deref() == Some(v.as_str()),
            Selector::SelLike(v) => self.test.as_deref().map_or(false, |t| t.contains(v.as_str())),
            Selector::Css(css) => match css.strip_prefix('#') {
                Some(id) => self.id.as_deref() == Some(id),
                None => self.tag == css.as_str(),
            },
        }
    }

    fn state(&self) -> ElementState {
        ElementState {
            text: self.text_content(),
            visible: self.visible,
            disabled: self.disabled,
            value: self.value.clone(),
        }
    }

    fn html(&self, out: &mut String) {
        out.push('<');
        out.push_str(self.tag);
        if let Some(test) = &self.test {
            out.push_str(&format!(" data-test=\"{}\"", test));
        }
        if let Some(id) = &self.id {
            out.push_str(&format!(" id=\"{}\"", id));
        }
        out.push('>');
        out.push_str(&self.text);
        for child in &self.children {
            child.html(out);
        }
        out.push_str(&format!("</{}>", self.tag));
    }
}

fn propagate_visibility(nodes: &mut [Node], parent_visible: bool) {
    for node in nodes {
        node.visible = node.visible && parent_visible;
        propagate_visibility(&mut node.children, node.visible);
    }
}

fn collect<'a>(nodes: &'a [Node], selector: &Selector, out: &mut Vec<&'a Node>) {
    for node in nodes {
        if node.matches(selector) {
            out.push(node);
        }
        collect(&node.children, selector, out);
    }
}

const FIELDS: [&str; 3] = ["bankName", "routingNumber", "accountNumber"];

fn validate(field: usize, value: &str) -> Option<&'static str> {
    let digits = !value.is_empty() && value.chars().all(|c| c.is_ascii_digit());
    match field {
        0 if value.is_empty() => Some("Enter a bank name"),
        0 if value.chars().count() < 5 => Some("Must contain at least 5 characters"),
        1 if value.is_empty() => Some("Enter a valid bank routing number"),
        1 if !(digits && value.len() == 9) => Some("Must contain a valid routing number"),
        2 if value.is_empty() => Some("Enter a valid bank account number"),
        2 if !(digits && (9..=12).contains(&value.len())) => Some("Must contain a valid account number"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
struct FieldState {
    value: String,
    touched: bool,
    dirty: bool,
}

#[derive(Debug, Clone, Default)]
struct Form {
    fields: [FieldState; 3],
    focused: Option<usize>,
}

impl Form {
    fn focus(&mut self, field: usize) {
        if let Some(previous) = self.focused {
            if previous != field {
                self.fields[previous].touched = true;
            }
        }
        self.focused = Some(field);
    }

    fn blur_all(&mut self) {
        if let Some(previous) = self.focused.take() {
            self.fields[previous].touched = true;
        }
    }

    fn shown_error(&self, field: usize) -> Option<&'static str> {
        let state = &self.fields[field];
        if state.touched {
            validate(field, &state.value)
        } else {
            None
        }
    }

    fn submit_disabled(&self) -> bool {
        self.fields
            .iter()
            .enumerate()
            .any(|(i, f)| (f.touched || f.dirty) && validate(i, &f.value).is_some())
    }

    fn valid(&self) -> bool {
        self.fields
            .iter()
            .enumerate()
            .all(|(i, f)| validate(i, &f.value).is_none())
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    id: String,
    bank_name: String,
    deleted: bool,
}

enum Response {
    Live,
    Stubbed(Value),
    Lost,
}

/// One page in a fresh browser context
pub struct SimDriver {
    app: SimApp,
    viewport: Viewport,
    cookies: Vec<SessionCookie>,
    page: Page,
    sidenav_open: bool,
    form: Form,
    list: Vec<ListEntry>,
    stubs: Vec<(RoutePattern, Value)>,
    events: Vec<NetworkEvent>,
    next_rid: u32,
    closed: bool,
}

impl SimDriver {
    fn new(app: SimApp, viewport: Viewport) -> Self {
        Self {
            app,
            viewport,
            cookies: Vec::new(),
            page: Page::Blank,
            sidenav_open: false,
            form: Form::default(),
            list: Vec::new(),
            stubs: Vec::new(),
            events: Vec::new(),
            next_rid: 0,
            closed: false,
        }
    }

    fn mobile(&self) -> bool {
        self.viewport.width < MOBILE_BREAKPOINT
    }

    fn ensure_open(&self) -> E2eResult<()> {
        if self.closed {
            return Err(E2eError::BridgeClosed);
        }
        Ok(())
    }

    fn request(&mut self, method: &str, path: &str) -> Response {
        let url = format!("{}{}", API_URL, path);
        let mode = self.app.network(method);
        if mode == Network::Silent {
            return Response::Lost;
        }

        self.next_rid += 1;
        let rid = format!("r{}", self.next_rid);
        self.events.push(NetworkEvent::Started {
            rid: rid.clone(),
            method: method.to_string(),
            url: url.clone(),
        });
        if mode == Network::Hang {
            return Response::Lost;
        }
        self.events.push(NetworkEvent::Finished { rid, status: Some(200) });

        match self.stubs.iter().rev().find(|(pattern, _)| pattern.matches(method, &url)) {
            Some((_, body)) => Response::Stubbed(body.clone()),
            None => Response::Live,
        }
    }

    fn load_list(&mut self) {
        match self.request("GET", "/bankAccounts") {
            Response::Live => {
                self.list = self
                    .app
                    .accounts()
                    .into_iter()
                    .map(|a| ListEntry {
                        id: a.id,
                        bank_name: a.bank_name,
                        deleted: a.deleted,
                    })
                    .collect();
            }
            Response::Stubbed(body) => {
                self.list = body
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .enumerate()
                            .map(|(i, item)| ListEntry {
                                id: item["id"].as_str().map(str::to_string).unwrap_or_else(|| format!("stub-{}", i)),
                                bank_name: item["bankName"].as_str().unwrap_or_default().to_string(),
                                deleted: item["isDeleted"].as_bool().unwrap_or(false),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
            }
            Response::Lost => {}
        }
    }

    /// Client-side route change
    fn navigate(&mut self, page: Page) {
        self.page = page;
        match page {
            Page::BankAccounts => self.load_list(),
            Page::NewBankAccount => self.form = Form::default(),
            _ => {}
        }
    }

    /// Full page load
    fn load(&mut self, page: Page) {
        if page != Page::Signin && !self.app.has_session(&self.cookies) {
            self.page = Page::Signin;
            return;
        }
        self.sidenav_open = false;
        if page != Page::Signin {
            self.request("GET", "/notifications");
        }
        self.navigate(page);
    }

    fn render(&self) -> Vec<Node> {
        let mut roots = match self.page {
            Page::Blank => Vec::new(),
            Page::Signin => vec![Node::new("form").test("signin-form")],
            page => {
                let content = match page {
                    Page::BankAccounts => self.render_list(),
                    Page::NewBankAccount => self.render_form(),
                    _ => Node::new("div").test("transaction-list"),
                };
                vec![
                    Node::new("button")
                        .test("sidenav-toggle")
                        .control(Control::SidenavToggle),
                    Node::new("nav")
                        .test("sidenav")
                        .hidden(self.mobile() && !self.sidenav_open)
                        .child(Node::new("a").test("sidenav-home").text("Home"))
                        .child(
                            Node::new("a")
                                .test("sidenav-bankaccounts")
                                .text("Bank Accounts")
                                .control(Control::NavBankAccounts),
                        ),
                    Node::new("main").child(content),
                ]
            }
        };
        propagate_visibility(&mut roots, true);
        roots
    }

    fn render_list(&self) -> Node {
        let mut page = Node::new("div").child(
            Node::new("a")
                .test("bankaccount-new")
                .text("Create")
                .control(Control::NewAccount),
        );

        if self.list.is_empty() {
            page = page
                .child(Node::new("h2").test("empty-list-header").text("No Bank Accounts"))
                .child(
                    Node::new("div")
                        .test("user-onboarding-dialog")
                        .text("Get Started with Real World App"),
                );
        } else {
            let mut list = Node::new("ul").test("bankaccount-list");
            for (i, entry) in self.list.iter().enumerate() {
                let mut item = Node::new("li")
                    .test(format!("bankaccount-list-item-{}", entry.id))
                    .child(Node::new("p").text(entry.bank_name.clone()));
                item = if entry.deleted {
                    item.child(Node::new("p").text("Deleted"))
                } else {
                    item.child(
                        Node::new("button")
                            .test("bankaccount-delete")
                            .text("Delete")
                            .control(Control::Delete(i)),
                    )
                };
                list = list.child(item);
            }
            page = page.child(list);
        }
        page
    }

    fn render_form(&self) -> Node {
        let mut form = Node::new("form").test("bankaccount-form");
        for (i, name) in FIELDS.iter().enumerate() {
            let wrapper = Node::new("div")
                .test(format!("bankaccount-{}-input", name))
                .control(Control::Field(i))
                .child(
                    Node::new("input")
                        .id(format!("bankaccount-{}-input", name))
                        .value(self.form.fields[i].value.clone())
                        .control(Control::Field(i)),
                );
            form = form.child(wrapper);
            if let Some(error) = self.form.shown_error(i) {
                form = form.child(
                    Node::new("p")
                        .id(format!("bankaccount-{}-input-helper-text", name))
                        .text(error),
                );
            }
        }
        form.child(
            Node::new("button")
                .test("bankaccount-submit")
                .text("Save")
                .disabled(!self.app.faults().submit_always_enabled && self.form.submit_disabled())
                .control(Control::Submit),
        )
    }

    /// `index` picks one selector match before `find` narrows into it
    fn find_all(&self, target: &Target) -> Vec<Node> {
        let roots = self.render();
        let mut matched = Vec::new();
        collect(&roots, &target.selector, &mut matched);
        if let Some(index) = target.index {
            matched = matched.into_iter().nth(index).into_iter().collect();
        }

        match &target.find {
            Some(find) => {
                let inner = Selector::Css(find.clone());
                let mut found = Vec::new();
                for node in matched {
                    collect(&node.children, &inner, &mut found);
                }
                found.into_iter().cloned().collect()
            }
            None => matched.into_iter().cloned().collect(),
        }
    }

    /// The single element an action addresses
    fn resolve(&self, target: &Target) -> E2eResult<Node> {
        let node = self
            .find_all(target)
            .into_iter()
            .next()
            .ok_or_else(|| E2eError::Driver(format!("no element for {}", target)))?;
        if !node.visible {
            return Err(E2eError::Driver(format!("{} is not visible", target)));
        }
        Ok(node)
    }

    /// Click without the bridge bookkeeping
    fn press(&mut self, target: &Target) -> E2eResult<()> {
        let node = self.resolve(target)?;
        if node.disabled {
            return Err(E2eError::Driver(format!("{} is disabled", target)));
        }

        match node.control {
            Some(Control::SidenavToggle) => self.sidenav_open = !self.sidenav_open,
            Some(Control::NavBankAccounts) => {
                self.sidenav_open = false;
                self.navigate(Page::BankAccounts);
            }
            Some(Control::NewAccount) => self.navigate(Page::NewBankAccount),
            Some(Control::Field(i)) => self.form.focus(i),
            Some(Control::Submit) => {
                self.form.blur_all();
                if self.form.valid() {
                    if let Response::Live = self.request("POST", "/bankAccounts") {
                        let [name, routing, account] = &self.form.fields;
                        self.app.create_account(&name.value, &routing.value, &account.value);
                    }
                    self.navigate(Page::BankAccounts);
                }
            }
            Some(Control::Delete(i)) => {
                let id = self.list[i].id.clone();
                if let Response::Live = self.request("DELETE", &format!("/bankAccounts/{}", id)) {
                    self.app.delete_account(&id);
                    self.load_list();
                }
            }
            None => {}
        }
        Ok(())
    }

    fn field(&self, target: &Target) -> E2eResult<usize> {
        match self.resolve(target)?.control {
            Some(Control::Field(i)) => Ok(i),
            _ => Err(E2eError::Driver(format!("{} is not an input", target))),
        }
    }
}

#[async_trait]
impl Driver for SimDriver {
    async fn visit(&mut self, url: &str) -> E2eResult<()> {
        self.ensure_open()?;
        let path = url.strip_prefix(APP_URL).unwrap_or(url);
        let page = match path {
            "/" | "" => Page::Home,
            "/signin" => Page::Signin,
            "/bankaccounts" => Page::BankAccounts,
            "/bankaccounts/new" => Page::NewBankAccount,
            other => return Err(E2eError::Driver(format!("no page at {}", other))),
        };
        self.load(page);
        Ok(())
    }

    async fn click(&mut self, target: &Target) -> E2eResult<()> {
        self.ensure_open()?;
        let result = self.press(target);
        if result.is_err() && self.app.faults().lose_bridge_on_error {
            self.closed = true;
        }
        result
    }

    async fn type_text(&mut self, target: &Target, text: &str) -> E2eResult<()> {
        self.ensure_open()?;
        let field = self.field(target)?;
        self.form.focus(field);
        let state = &mut self.form.fields[field];
        state.value.push_str(text);
        state.dirty = true;
        Ok(())
    }

    async fn clear(&mut self, target: &Target) -> E2eResult<()> {
        self.ensure_open()?;
        let field = self.field(target)?;
        self.form.focus(field);
        let state = &mut self.form.fields[field];
        state.value.clear();
        state.dirty = true;
        Ok(())
    }

    async fn blur(&mut self, target: &Target) -> E2eResult<()> {
        self.ensure_open()?;
        let field = self.field(target)?;
        if self.form.focused == Some(field) {
            self.form.focused = None;
        }
        self.form.fields[field].touched = true;
        Ok(())
    }

    async fn query(&mut self, target: &Target) -> E2eResult<Vec<ElementState>> {
        self.ensure_open()?;
        Ok(self.find_all(target).iter().map(Node::state).collect())
    }

    async fn pathname(&mut self) -> E2eResult<String> {
        self.ensure_open()?;
        Ok(self.page.path().to_string())
    }

    async fn url(&mut self) -> E2eResult<String> {
        self.ensure_open()?;
        Ok(match self.page {
            Page::Blank => "about:blank".to_string(),
            page => format!("{}{}", APP_URL, page.path()),
        })
    }

    async fn add_cookies(&mut self, cookies: &[SessionCookie]) -> E2eResult<()> {
        self.ensure_open()?;
        self.cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn stub_route(&mut self, route: &Route) -> E2eResult<()> {
        self.ensure_open()?;
        let pattern = RoutePattern::compile(&route.method, &route.path)?;
        self.stubs.push((pattern, route.stub.clone().unwrap_or(Value::Null)));
        Ok(())
    }

    async fn drain_network(&mut self) -> E2eResult<Vec<NetworkEvent>> {
        self.ensure_open()?;
        Ok(std::mem::take(&mut self.events))
    }

    async fn screenshot(&mut self) -> E2eResult<Vec<u8>> {
        self.ensure_open()?;
        let img = RgbaImage::new((self.viewport.width / 8).max(1), (self.viewport.height / 8).max(1));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    }

    async fn dom_snapshot(&mut self) -> E2eResult<String> {
        self.ensure_open()?;
        let mut html = String::from("<html><body>");
        for node in self.render() {
            node.html(&mut html);
        }
        html.push_str("</body></html>");
        Ok(html)
    }

    async fn close(&mut self) -> E2eResult<()> {
        if !self.closed {
            self.closed = true;
            self.app.backend.lock().closed += 1;
        }
        Ok(())
    }
}
