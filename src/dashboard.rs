use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    backend::{BackendClient, BackendError},
    config::Settings,
    metrix::load_report,
    provisioning::{AccountForm, AccountProvisioner, FormError},
    store::SqliteStore,
    utils::{now_ms, now_ts},
};

#[derive(Clone)]
pub struct DashboardState {
    pub settings: Settings,
    pub store: SqliteStore,
    pub client: BackendClient,
    pub provisioner: AccountProvisioner,
}

impl DashboardState {
    pub fn new(settings: Settings, store: SqliteStore) -> Result<Self> {
        let client = BackendClient::new(&settings)?;
        let provisioner =
            AccountProvisioner::new(client.clone(), store.clone(), settings.accounts_cache_ttl_secs);
        Ok(Self {
            settings,
            store,
            client,
            provisioner,
        })
    }

    fn mark(&self, component: &str, level: &str, message: &str, detail: Option<&str>) {
        if let Err(e) = self
            .store
            .upsert_runtime_status(component, level, message, detail, now_ts())
        {
            log::warn!("dashboard.status_write_failed component={} err={}", component, e);
        }
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(index))
        .route("/api/health", get(api_health))
        .route("/api/accounts", get(api_accounts).post(api_create_account))
        .route("/api/accounts/refresh", post(api_refresh_accounts))
        .route("/api/metrix/{document_id}", get(api_metrix))
        .route("/api/admin/clear_cache", post(api_clear_cache))
        .layer(cors)
        .with_state(state)
}

pub async fn serve_dashboard(settings: Settings, store: SqliteStore) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.dashboard_host, settings.dashboard_port)
        .parse()
        .context("dashboard addr parse")?;
    let state = DashboardState::new(settings, store)?;
    state.mark("dashboard", "ok", "listening", Some(&addr.to_string()));

    let app = router(state);
    log::info!("dashboard.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn request_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(
        raw.strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw),
    )
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "missing_token"})),
    )
        .into_response()
}

fn error_response(st: &DashboardState, component: &str, e: &anyhow::Error) -> Response {
    let status = if e.downcast_ref::<FormError>().is_some() {
        StatusCode::BAD_REQUEST
    } else {
        match e.downcast_ref::<BackendError>() {
            Some(BackendError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            Some(_) => StatusCode::BAD_GATEWAY,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    let msg = format!("{e:#}");
    if status == StatusCode::BAD_GATEWAY {
        st.mark("backend", "error", "request failed", Some(&msg));
    } else if status == StatusCode::INTERNAL_SERVER_ERROR {
        st.mark(component, "error", "request failed", Some(&msg));
    }
    log::warn!("{}.request_failed status={} err={}", component, status.as_u16(), msg);
    (status, Json(serde_json::json!({"ok": false, "error": msg}))).into_response()
}

async fn index(State(st): State<DashboardState>) -> impl IntoResponse {
    Html(render_index_html(
        st.client.base_url(),
        st.store.path(),
        st.settings.accounts_cache_ttl_secs,
        st.settings.dashboard_enable_reset,
    ))
}

async fn api_health(State(st): State<DashboardState>) -> impl IntoResponse {
    let ts = now_ts();
    let health = st
        .store
        .fetch_runtime_statuses()
        .unwrap_or_else(|_| serde_json::json!({}));
    Json(serde_json::json!({ "ts": ts, "components": health }))
}

async fn api_accounts(State(st): State<DashboardState>, headers: HeaderMap) -> Response {
    let Some(token) = st.settings.bearer(request_token(&headers)) else {
        return unauthorized();
    };
    match st.provisioner.listing(token).await {
        Ok(listing) => {
            st.mark("backend", "ok", "reachable", None);
            Json(listing).into_response()
        }
        Err(e) => error_response(&st, "accounts", &e),
    }
}

async fn api_refresh_accounts(State(st): State<DashboardState>, headers: HeaderMap) -> Response {
    let Some(token) = st.settings.bearer(request_token(&headers)) else {
        return unauthorized();
    };
    match st.provisioner.refresh(token).await {
        Ok(listing) => {
            st.mark("backend", "ok", "reachable", None);
            Json(listing).into_response()
        }
        Err(e) => error_response(&st, "accounts", &e),
    }
}

async fn api_create_account(
    State(st): State<DashboardState>,
    headers: HeaderMap,
    Json(form): Json<AccountForm>,
) -> Response {
    let Some(token) = st.settings.bearer(request_token(&headers)) else {
        return unauthorized();
    };
    match st.provisioner.create(token, &form).await {
        Ok((account, listing)) => {
            st.mark(
                "accounts",
                "ok",
                "account created",
                account.login.as_deref(),
            );
            Json(serde_json::json!({
                "ok": true,
                "account": account,
                "listing": listing,
            }))
            .into_response()
        }
        Err(e) => error_response(&st, "accounts", &e),
    }
}

async fn api_metrix(
    State(st): State<DashboardState>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = st.settings.bearer(request_token(&headers)) else {
        return unauthorized();
    };
    match load_report(&st.client, token, &document_id, now_ms()).await {
        Ok(Some(report)) => {
            st.mark("backend", "ok", "reachable", None);
            Json(report).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"ok": false, "error": "challenge_not_found"})),
        )
            .into_response(),
        Err(e) => error_response(&st, "metrix", &e),
    }
}

async fn api_clear_cache(State(st): State<DashboardState>) -> impl IntoResponse {
    if !st.settings.dashboard_enable_reset {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"ok": false, "error": "reset_disabled"})),
        )
            .into_response();
    }
    if let Err(e) = st.store.clear_cache() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": false, "error": e.to_string()})),
        )
            .into_response();
    }
    log::info!("dashboard.cache_cleared");
    Json(serde_json::json!({"ok": true, "ts": now_ts()})).into_response()
}

fn render_index_html(backend_url: &str, sqlite_path: &str, cache_ttl_secs: u64, can_reset: bool) -> String {
    // Single-file UI, no build step.
    let reset_btn = if can_reset {
        r#"<button class="btn" id="clearBtn" style="border-color: rgba(255,77,77,0.45);">Clear cache</button>"#
    } else {
        ""
    };

    format!(
        r##"<!doctype html>
 <html lang="en">
   <head>
     <meta charset="utf-8" />
     <meta name="viewport" content="width=device-width, initial-scale=1" />
     <title>Metrix • Challenge Admin</title>
     <style>
       :root {{
         --bg: #0b1220;
         --panel: rgba(255,255,255,0.06);
         --stroke: rgba(255,255,255,0.12);
         --text: rgba(255,255,255,0.92);
         --muted: rgba(255,255,255,0.65);
         --good: #33d17a;
         --bad: #ff4d4d;
         --warn: #ffcc00;
         --brand: #7c5cff;
         --brand2: #3dd6d0;
       }}
       * {{ box-sizing: border-box; }}
       body {{
         margin: 0;
         font-family: ui-sans-serif, system-ui, -apple-system, Segoe UI, Roboto, Helvetica, Arial;
         color: var(--text);
         background: radial-gradient(1200px 900px at 15% 10%, rgba(124,92,255,0.20), transparent 60%),
                     radial-gradient(1100px 800px at 90% 20%, rgba(61,214,208,0.16), transparent 55%),
                     var(--bg);
       }}
       .wrap {{ max-width: 1280px; margin: 0 auto; padding: 22px 18px 42px; }}
       .topbar {{
         display: flex; align-items: center; justify-content: space-between; gap: 12px;
         padding: 16px 16px; border: 1px solid var(--stroke); border-radius: 16px;
         background: linear-gradient(180deg, rgba(255,255,255,0.06), rgba(255,255,255,0.03));
       }}
       .title {{ font-weight: 800; letter-spacing: 0.2px; }}
       .subtitle {{ color: var(--muted); font-size: 12px; margin-top: 2px; }}
       .chips {{ display: flex; flex-wrap: wrap; gap: 8px; justify-content: flex-end; }}
       .chip {{
         padding: 7px 10px; border-radius: 999px; border: 1px solid var(--stroke);
         background: rgba(255,255,255,0.04); font-size: 12px; color: var(--muted); white-space: nowrap;
       }}
       .chip b {{ color: var(--text); font-weight: 700; }}
       .grid {{ display: grid; gap: 14px; margin-top: 14px; grid-template-columns: repeat(12, 1fr); }}
       .card {{ border: 1px solid var(--stroke); border-radius: 16px; background: var(--panel); overflow: hidden; }}
       .card .hd {{
         display:flex; align-items: center; justify-content: space-between; gap: 10px;
         padding: 12px 14px; border-bottom: 1px solid rgba(255,255,255,0.08); background: rgba(255,255,255,0.03);
       }}
       .card .hd .h {{ font-weight: 800; }}
       .card .bd {{ padding: 12px 14px; }}
       .kpis {{ display: grid; gap: 10px; grid-template-columns: repeat(5, 1fr); }}
       .kpi {{ border: 1px solid rgba(255,255,255,0.10); border-radius: 14px; background: rgba(255,255,255,0.04); padding: 12px; }}
       .kpi .lbl {{ color: var(--muted); font-size: 12px; }}
       .kpi .val {{ font-size: 20px; font-weight: 850; margin-top: 6px; }}
       .good {{ color: var(--good); }}
       .bad {{ color: var(--bad); }}
       .warn {{ color: var(--warn); }}
       table {{ width: 100%; border-collapse: collapse; }}
       th, td {{ padding: 9px 10px; border-bottom: 1px solid rgba(255,255,255,0.07); text-align: left; }}
       th {{ color: var(--muted); font-size: 12px; font-weight: 700; }}
       td {{ font-size: 13px; }}
       .mono {{ font-family: ui-monospace, SFMono-Regular, Menlo, Monaco, Consolas, monospace; }}
       input, select {{
         width: 100%; padding: 8px 10px; border-radius: 10px; border: 1px solid var(--stroke);
         background: rgba(0,0,0,0.25); color: var(--text); font-size: 13px;
       }}
       label {{ display:block; font-size: 12px; color: var(--muted); margin: 8px 0 4px; }}
       .btn {{
         cursor: pointer; padding: 8px 10px; border-radius: 10px; border: 1px solid rgba(255,255,255,0.12);
         background: rgba(255,255,255,0.05); color: var(--text); font-weight: 700; font-size: 12px;
       }}
       .btn:hover {{ background: rgba(255,255,255,0.08); }}
       .split {{ display:flex; gap: 10px; flex-wrap: wrap; align-items: center; }}
       .progress {{ height: 10px; border-radius: 999px; background: rgba(255,255,255,0.07); overflow: hidden; margin: 6px 0 12px; }}
       .bar {{ height: 100%; width: 0%; background: linear-gradient(90deg, var(--brand), var(--brand2)); }}
       .bar.bad {{ background: var(--bad); }}
       .small {{ font-size: 12px; color: var(--muted); }}
       .banner {{
         margin-top: 12px; padding: 10px 12px; border-radius: 14px; border: 1px solid rgba(255,255,255,0.14);
         background: rgba(255, 77, 77, 0.10); display: none;
       }}
       svg {{ width: 100%; height: 220px; }}
       .col-12 {{ grid-column: span 12; }}
       .col-8 {{ grid-column: span 8; }}
       .col-4 {{ grid-column: span 4; }}
       @media (max-width: 1100px) {{
         .kpis {{ grid-template-columns: repeat(2, 1fr); }}
         .col-8, .col-4 {{ grid-column: span 12; }}
       }}
     </style>
   </head>
   <body>
     <div class="wrap">
       <div class="topbar">
         <div>
           <div class="title">Metrix • Challenge Admin</div>
           <div class="subtitle">broker account pool and challenge metrics</div>
         </div>
         <div class="chips">
           <div class="chip">backend <b class="mono">{backend_url}</b></div>
           <div class="chip">cache <b class="mono">{sqlite_path}</b></div>
           <div class="chip">ttl <b>{cache_ttl_secs}s</b></div>
           <div class="chip">status <b id="status">--</b></div>
         </div>
       </div>

       <div class="split" style="margin-top: 12px;">
         <div style="flex: 1; min-width: 260px;">
           <input id="token" type="password" autocomplete="off" placeholder="bearer token (optional when API_TOKEN is set)" />
         </div>
         <button class="btn" id="refreshBtn">Refresh accounts</button>
         {reset_btn}
       </div>
       <div class="banner" id="banner"><b id="bannerTitle"></b><div class="mono small" id="bannerMsg"></div></div>

       <div class="grid">
         <div class="card col-12">
           <div class="hd"><div class="h">Unused accounts by tier</div><div class="small" id="accMeta">--</div></div>
           <div class="bd"><div class="kpis" id="tiers"></div></div>
         </div>

         <div class="card col-8">
           <div class="hd"><div class="h">Unused broker accounts</div></div>
           <div class="bd">
             <table>
               <thead><tr><th>Login</th><th>Balance</th><th>Server</th><th>Platform</th><th>Credentials</th></tr></thead>
               <tbody id="accRows"></tbody>
             </table>
           </div>
         </div>

         <div class="card col-4">
           <div class="hd"><div class="h">New broker account</div></div>
           <div class="bd">
             <form id="createForm" autocomplete="off">
               <label>Login</label><input name="login" />
               <label>Password</label><input name="password" type="password" />
               <label>Server</label><input name="server" />
               <label>Balance</label><select name="balance" id="balanceSel"></select>
               <label>Platform</label>
               <select name="platform"><option value="mt4">MT4</option><option value="mt5">MT5</option></select>
               <label>Investor password</label><input name="inversorPass" type="password" />
               <div style="margin-top: 12px;"><button class="btn" type="submit">Create</button></div>
             </form>
           </div>
         </div>

         <div class="card col-12">
           <div class="hd">
             <div class="h">Challenge metrics</div>
             <div class="split">
               <input id="docId" placeholder="challenge document id" style="width: 280px;" />
               <button class="btn" id="loadBtn">Load</button>
             </div>
           </div>
           <div class="bd">
             <div class="kpis">
               <div class="kpi"><div class="lbl">Balance</div><div class="val" id="mBal">--</div></div>
               <div class="kpi"><div class="lbl">Equity</div><div class="val" id="mEq">--</div></div>
               <div class="kpi"><div class="lbl">Profit</div><div class="val" id="mProfit">--</div></div>
               <div class="kpi"><div class="lbl">Max drawdown</div><div class="val" id="mDd">--</div></div>
               <div class="kpi"><div class="lbl">Stage</div><div class="val" id="mStage">--</div></div>
             </div>
             <div style="margin-top: 12px;">
               <div class="small" id="ddLbl">drawdown</div>
               <div class="progress"><div class="bar bad" id="ddBar"></div></div>
               <div class="small" id="ptLbl">profit target</div>
               <div class="progress"><div class="bar" id="ptBar"></div></div>
             </div>
             <svg id="chart" viewBox="0 0 1000 220" preserveAspectRatio="none"></svg>
             <div class="small" id="mMeta">--</div>
           </div>
         </div>

         <div class="card col-8">
           <div class="hd"><div class="h">Other challenges</div></div>
           <div class="bd">
             <table>
               <thead><tr><th>Document</th><th>Phase</th><th>Result</th><th>Login</th></tr></thead>
               <tbody id="relRows"></tbody>
             </table>
           </div>
         </div>

         <div class="card col-4">
           <div class="hd"><div class="h">Health</div></div>
           <div class="bd"><table><tbody id="healthRows"></tbody></table></div>
         </div>
       </div>
     </div>

     <script>
       const TIERS = [5000, 10000, 25000, 50000, 100000];

       function escapeHtml(s) {{
         return String(s).replace(/[&<>"']/g, (c) => ({{"&":"&amp;","<":"&lt;",">":"&gt;","\"":"&quot;","'":"&#39;"}}[c]));
       }}
       function fmtUsd(x) {{
         const n = Number(x);
         return Number.isFinite(n) ? "$" + n.toLocaleString(undefined, {{maximumFractionDigits: 2}}) : "--";
       }}
       function fmtPct(x) {{
         const n = Number(x);
         return Number.isFinite(n) ? n.toFixed(2) + "%" : "--";
       }}
       function headers(json) {{
         const h = {{}};
         const t = document.getElementById("token").value.trim();
         if (t) h["Authorization"] = "Bearer " + t;
         if (json) h["Content-Type"] = "application/json";
         return h;
       }}
       async function call(method, url, body) {{
         const r = await fetch(url, {{ method, headers: headers(body !== undefined), body: body === undefined ? undefined : JSON.stringify(body) }});
         const data = await r.json().catch(() => ({{}}));
         if (!r.ok) throw new Error(`${{r.status}} ${{data.error || r.statusText}}`);
         return data;
       }}
       function showBanner(title, msg) {{
         document.getElementById("bannerTitle").textContent = title;
         document.getElementById("bannerMsg").textContent = msg;
         document.getElementById("banner").style.display = "block";
       }}
       function hideBanner() {{ document.getElementById("banner").style.display = "none"; }}

       function renderListing(l) {{
         const tiers = document.getElementById("tiers");
         tiers.innerHTML = "";
         for (const t of (l.tiers || [])) {{
           const d = document.createElement("div");
           d.className = "kpi";
           d.innerHTML = `<div class="lbl">${{escapeHtml(t.label)}}</div><div class="val ${{t.count ? "" : "warn"}}">${{t.count}}</div>`;
           tiers.appendChild(d);
         }}
         const tb = document.getElementById("accRows");
         tb.innerHTML = "";
         for (const a of (l.accounts || [])) {{
           const creds = [a.hasPassword ? "password" : null, a.hasInvestorPassword ? "investor" : null].filter(Boolean).join(", ");
           const tr = document.createElement("tr");
           tr.innerHTML = `
             <td class="mono">${{escapeHtml(a.login || "--")}}</td>
             <td>${{fmtUsd(a.balance)}}</td>
             <td>${{escapeHtml(a.server || "--")}}</td>
             <td>${{escapeHtml((a.platform || "--").toUpperCase())}}</td>
             <td class="small">${{escapeHtml(creds || "none")}}</td>
           `;
           tb.appendChild(tr);
         }}
         document.getElementById("accMeta").textContent = l.fetchedTs
           ? "fetched " + new Date(Number(l.fetchedTs) * 1000).toLocaleTimeString()
           : "--";
       }}

       function renderChart(report) {{
         const svg = document.getElementById("chart");
         const pts = report?.stats?.equityChart || [];
         if (pts.length < 2) {{ svg.innerHTML = ""; return; }}
         const band = report.chartBand;
         const ys = pts.flatMap((p) => [p.equity, p.balance]).concat([band.drawdownFloor, band.profitCeiling]);
         const lo = Math.min(...ys), hi = Math.max(...ys);
         const t0 = pts[0].timestamp, t1 = pts[pts.length - 1].timestamp;
         const x = (t) => t1 === t0 ? 0 : 1000 * (t - t0) / (t1 - t0);
         const y = (v) => hi === lo ? 110 : 210 - 200 * (v - lo) / (hi - lo);
         const line = (k) => pts.map((p) => `${{x(p.timestamp).toFixed(1)}},${{y(p[k]).toFixed(1)}}`).join(" ");
         svg.innerHTML = `
           <line x1="0" x2="1000" y1="${{y(band.drawdownFloor)}}" y2="${{y(band.drawdownFloor)}}" stroke="#ff4d4d" stroke-dasharray="6 6" />
           <line x1="0" x2="1000" y1="${{y(band.profitCeiling)}}" y2="${{y(band.profitCeiling)}}" stroke="#33d17a" stroke-dasharray="6 6" />
           <polyline fill="none" stroke="#3dd6d0" stroke-width="2" points="${{line("balance")}}" />
           <polyline fill="none" stroke="#7c5cff" stroke-width="2" points="${{line("equity")}}" />
         `;
       }}

       function renderReport(r) {{
         const s = r.stats;
         document.getElementById("mBal").textContent = s ? fmtUsd(s.balance) : "pending";
         document.getElementById("mEq").textContent = s ? fmtUsd(s.equity) : "pending";
         const profit = Number(s?.profit ?? 0);
         const pEl = document.getElementById("mProfit");
         pEl.textContent = s ? `${{fmtUsd(profit)}} (${{fmtPct(s.profitPercent)}})` : "pending";
         pEl.className = "val " + (profit >= 0 ? "good" : "bad");
         document.getElementById("mDd").textContent = s ? `${{fmtUsd(s.maxDrawdown)}} (${{fmtPct(s.maxDrawdownPercent)}})` : "pending";
         document.getElementById("mStage").textContent = r.stage ? (r.stage.name || `phase ${{r.phase}}`) : "--";

         const dd = Number(s?.maxDrawdownPercent ?? 0);
         const pp = Math.max(0, Number(s?.profitPercent ?? 0));
         document.getElementById("ddLbl").textContent = `drawdown ${{fmtPct(dd)}} of ${{fmtPct(r.maxDrawdownPercent)}}`;
         document.getElementById("ptLbl").textContent = `profit ${{fmtPct(pp)}} of ${{fmtPct(r.profitTargetPercent)}}`;
         document.getElementById("ddBar").style.width = `${{Math.min(100, 100 * dd / r.maxDrawdownPercent)}}%`;
         document.getElementById("ptBar").style.width = `${{Math.min(100, 100 * pp / r.profitTargetPercent)}}%`;
         renderChart(r);

         const meta = [`source ${{r.source}}`];
         if (r.trader) meta.unshift(`trader ${{r.trader}}`);
         if (r.thresholds.drawdownFloor != null) meta.push(`floor ${{fmtUsd(r.thresholds.drawdownFloor)}}`);
         if (r.thresholds.profitCeiling != null) meta.push(`target ${{fmtUsd(r.thresholds.profitCeiling)}}`);
         if (!r.objectives) meta.push("objectives unknown");
         if (r.certificate) meta.push(`certificate: ${{r.certificate.tipoChallenge || "issued"}}`);
         document.getElementById("mMeta").textContent = meta.join(" • ");

         const tb = document.getElementById("relRows");
         tb.innerHTML = "";
         for (const c of (r.related || [])) {{
           const tr = document.createElement("tr");
           tr.innerHTML = `
             <td class="mono">${{escapeHtml(c.documentId || "--")}}</td>
             <td>${{escapeHtml(c.phase ?? "--")}}</td>
             <td>${{escapeHtml(c.result || "--")}}</td>
             <td class="mono">${{escapeHtml(c.login || "--")}}</td>
           `;
           tb.appendChild(tr);
         }}
       }}

       async function loadHealth() {{
         try {{
           const h = await call("GET", "/api/health");
           const tb = document.getElementById("healthRows");
           tb.innerHTML = "";
           for (const [k, v] of Object.entries(h.components || {{}})) {{
             const cls = v.level === "ok" ? "good" : (v.level === "error" ? "bad" : "warn");
             const tr = document.createElement("tr");
             tr.innerHTML = `<td class="mono">${{escapeHtml(k)}}</td><td class="${{cls}}"><b>${{escapeHtml(v.level)}}</b></td><td class="small">${{escapeHtml(v.message)}}</td>`;
             tb.appendChild(tr);
           }}
           document.getElementById("status").textContent = "live";
         }} catch (e) {{
           document.getElementById("status").textContent = "disconnected";
         }}
       }}

       async function loadAccounts(force) {{
         try {{
           renderListing(await call(force ? "POST" : "GET", force ? "/api/accounts/refresh" : "/api/accounts"));
           hideBanner();
         }} catch (e) {{
           showBanner("Accounts unavailable", e.message);
         }}
       }}

       const sel = document.getElementById("balanceSel");
       for (const t of TIERS) {{
         const o = document.createElement("option");
         o.value = String(t);
         o.textContent = fmtUsd(t);
         sel.appendChild(o);
       }}

       document.getElementById("createForm").addEventListener("submit", async (ev) => {{
         ev.preventDefault();
         const f = ev.target;
         const body = Object.fromEntries(new FormData(f).entries());
         try {{
           const res = await call("POST", "/api/accounts", body);
           f.password.value = "";
           f.inversorPass.value = "";
           f.login.value = "";
           renderListing(res.listing);
           hideBanner();
         }} catch (e) {{
           showBanner("Create failed", e.message);
         }}
       }});

       document.getElementById("loadBtn").addEventListener("click", async () => {{
         const id = document.getElementById("docId").value.trim();
         if (!id) return;
         try {{
           renderReport(await call("GET", "/api/metrix/" + encodeURIComponent(id)));
           hideBanner();
         }} catch (e) {{
           showBanner("Metrics unavailable", e.message);
         }}
       }});

       document.getElementById("refreshBtn").addEventListener("click", () => loadAccounts(true));
       const clearBtn = document.getElementById("clearBtn");
       if (clearBtn) {{
         clearBtn.addEventListener("click", async () => {{
           if (!confirm("Clear the local account cache?")) return;
           try {{
             await call("POST", "/api/admin/clear_cache");
             await loadAccounts(true);
           }} catch (e) {{
             showBanner("Clear failed", e.message);
           }}
         }});
       }}

       loadAccounts(false);
       loadHealth();
       setInterval(loadHealth, 5000);
     </script>
   </body>
 </html>"##,
        backend_url = backend_url,
        sqlite_path = sqlite_path,
        cache_ttl_secs = cache_ttl_secs,
        reset_btn = reset_btn
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::fake::{FakeBackend, TOKEN},
        config::test_settings,
        store::temp_store,
    };
    use serde_json::{json, Value as JsonValue};

    async fn spawn_dashboard(backend: &FakeBackend, tweak: impl FnOnce(&mut Settings)) -> String {
        let url = backend.spawn().await;
        let store = temp_store();
        let mut settings = test_settings(&url, store.path());
        tweak(&mut settings);
        let app = router(DashboardState::new(settings, store).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn request_token_strips_scheme() {
        let mut h = HeaderMap::new();
        assert_eq!(request_token(&h), None);
        h.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(request_token(&h), Some("abc"));
        h.insert(header::AUTHORIZATION, "raw-token".parse().unwrap());
        assert_eq!(request_token(&h), Some("raw-token"));
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let backend = FakeBackend::default();
        let base = spawn_dashboard(&backend, |_| {}).await;
        let r = reqwest::get(format!("{base}/api/accounts")).await.unwrap();
        assert_eq!(r.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn configured_token_is_used_as_fallback() {
        let backend = FakeBackend::default();
        let base = spawn_dashboard(&backend, |s| s.api_token = Some(TOKEN.to_string())).await;
        let r = reqwest::get(format!("{base}/api/accounts")).await.unwrap();
        assert_eq!(r.status().as_u16(), 200);
        let body: JsonValue = r.json().await.unwrap();
        assert_eq!(body["tiers"].as_array().map(|t| t.len()), Some(5));
    }

    #[tokio::test]
    async fn create_validation_error_is_400() {
        let backend = FakeBackend::default();
        let base = spawn_dashboard(&backend, |_| {}).await;
        let r = reqwest::Client::new()
            .post(format!("{base}/api/accounts"))
            .bearer_auth(TOKEN)
            .json(&json!({"login": "", "password": "pw", "server": "s", "balance": "5000"}))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn create_returns_listing_without_secrets() {
        let backend = FakeBackend::default();
        let base = spawn_dashboard(&backend, |_| {}).await;
        let r = reqwest::Client::new()
            .post(format!("{base}/api/accounts"))
            .bearer_auth(TOKEN)
            .json(&json!({
                "login": "770001",
                "password": "hunter2",
                "server": "Demo-1",
                "balance": "25000",
                "platform": "mt5",
                "inversorPass": "viewer9"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 200);
        let text = r.text().await.unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("viewer9"));
        let body: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(body["account"]["login"], "770001");
        assert_eq!(body["listing"]["accounts"].as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn unknown_challenge_is_404() {
        let backend = FakeBackend::default();
        *backend.me.lock().await = json!({"id": 1, "challenges": []});
        let base = spawn_dashboard(&backend, |_| {}).await;
        let r = reqwest::Client::new()
            .get(format!("{base}/api/metrix/missing"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn clear_cache_requires_reset_flag() {
        let backend = FakeBackend::default();
        let base = spawn_dashboard(&backend, |_| {}).await;
        let r = reqwest::Client::new()
            .post(format!("{base}/api/admin/clear_cache"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 403);

        let base = spawn_dashboard(&backend, |s| s.dashboard_enable_reset = true).await;
        let r = reqwest::Client::new()
            .post(format!("{base}/api/admin/clear_cache"))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 200);
    }
}
